//! 领域模型错误定义

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("{field}: {reason}")]
    InvalidArgument { field: String, reason: String },
    #[error("user not found")]
    UserNotFound,
    #[error("unknown status value: {value}")]
    UnknownStatus { value: String },
    #[error("unknown device type: {value}")]
    UnknownDeviceType { value: String },
}

impl DomainError {
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type DomainResult<T> = Result<T, DomainError>;

/// 存储层错误类型，由各 Repository 实现映射产生。
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("requested record not found")]
    NotFound,
    #[error("conflicting record already exists")]
    Conflict,
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}
