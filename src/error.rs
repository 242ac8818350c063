// Copyright 2023 The TabletMeta Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use thiserror::Error;

pub type Result<T, E = MetaError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("coordination service unavailable: {message}")]
    CoordinationUnavailable { message: String },
    #[error("metadata store unavailable: {message}")]
    StoreUnavailable { message: String },
    #[error("security failure: {message}")]
    SecurityFailure { message: String },
    #[error("constraint violation on row {row:?}: {message}")]
    ConstraintViolation { row: String, message: String },
    #[error("table {table} not found")]
    TableNotFound { table: String },
    #[error("data corruption: {message}")]
    DataCorruption { message: String },
    #[error("source table {table} mutated: {message}")]
    SourceMutated { table: String, message: String },
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
    #[error("{operation} cancelled")]
    Cancelled { operation: String },
    #[error("{operation} deadline exceeded: {last}")]
    DeadlineExceeded { operation: String, last: Box<MetaError> },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MetaError {
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::DataCorruption { message: message.into() }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    pub fn coordination(message: impl Into<String>) -> Self {
        Self::CoordinationUnavailable { message: message.into() }
    }

    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable { message: message.into() }
    }

    pub fn constraint_violation(row: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConstraintViolation { row: row.into(), message: message.into() }
    }

    pub fn source_mutated(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SourceMutated { table: table.into(), message: message.into() }
    }

    pub fn table_not_found(table: impl Into<String>) -> Self {
        Self::TableNotFound { table: table.into() }
    }

    /// Infrastructure failures that clear up by themselves given time.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CoordinationUnavailable { .. } | Self::StoreUnavailable { .. } | Self::SecurityFailure { .. }
        )
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::DataCorruption { .. })
    }
}
