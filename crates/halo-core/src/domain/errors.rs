use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type HaloResult<T> = Result<T, HaloError>;
pub type PipelineResult<T> = HaloResult<T>;
pub type FinderResult<T> = HaloResult<T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HaloErrorCategory {
    Success,
    Configuration,
    Lookup,
    IoSystem,
    Computation,
    Coordination,
    Internal,
}

impl HaloErrorCategory {
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Configuration => 2,
            Self::Lookup => 3,
            Self::IoSystem => 4,
            Self::Computation => 5,
            Self::Coordination => 6,
            Self::Internal => 7,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Configuration => "ConfigurationError",
            Self::Lookup => "LookupError",
            Self::IoSystem => "IoSystemError",
            Self::Computation => "ComputationError",
            Self::Coordination => "CoordinationError",
            Self::Internal => "InternalError",
        }
    }

    pub const fn is_fatal(self) -> bool {
        !matches!(self, Self::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaloError {
    category: HaloErrorCategory,
    placeholder: &'static str,
    message: String,
}

impl HaloError {
    pub fn new(
        category: HaloErrorCategory,
        placeholder: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            placeholder,
            message: message.into(),
        }
    }

    pub fn configuration(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(HaloErrorCategory::Configuration, placeholder, message)
    }

    pub fn lookup(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(HaloErrorCategory::Lookup, placeholder, message)
    }

    pub fn io_system(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(HaloErrorCategory::IoSystem, placeholder, message)
    }

    pub fn computation(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(HaloErrorCategory::Computation, placeholder, message)
    }

    pub fn coordination(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(HaloErrorCategory::Coordination, placeholder, message)
    }

    pub fn internal(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(HaloErrorCategory::Internal, placeholder, message)
    }

    pub const fn category(&self) -> HaloErrorCategory {
        self.category
    }

    pub const fn placeholder(&self) -> &'static str {
        self.placeholder
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn exit_code(&self) -> i32 {
        self.category.exit_code()
    }

    pub fn diagnostic_line(&self) -> String {
        let severity = if self.category.is_fatal() {
            "ERROR"
        } else {
            "INFO"
        };
        format!("{}: [{}] {}", severity, self.placeholder, self.message)
    }

    pub fn fatal_exit_line(&self) -> Option<String> {
        self.category
            .is_fatal()
            .then(|| format!("FATAL EXIT CODE: {}", self.exit_code()))
    }
}

impl Display for HaloError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.category.as_str(),
            self.placeholder,
            self.message
        )
    }
}

impl Error for HaloError {}

impl From<serde_json::Error> for HaloError {
    fn from(source: serde_json::Error) -> Self {
        Self::io_system("IO.SERDE", source.to_string())
    }
}
