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

//! Sorted, row mutable store holding metadata rows of all tablets except root tablet.

mod memory;
mod writer;

use std::fmt::{self, Display, Formatter};
use std::ops::Bound;

use async_trait::async_trait;
use compact_str::CompactString;

pub use self::memory::MemoryMetadataStore;
pub use self::writer::{BatchWriter, BatchWriterConfig};
use crate::clock::Millis;
use crate::error::Result;

/// Column carrying lock identity of writer, checked by store before applying a mutation.
pub const LOCK_COLUMN: Column = Column::constant("srv", "lock");

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Column {
    pub family: CompactString,
    pub qualifier: CompactString,
}

impl Column {
    pub const fn constant(family: &'static str, qualifier: &'static str) -> Self {
        Self { family: CompactString::new_inline(family), qualifier: CompactString::new_inline(qualifier) }
    }

    pub fn new(family: impl Into<CompactString>, qualifier: impl Into<CompactString>) -> Self {
        Self { family: family.into(), qualifier: qualifier.into() }
    }

    fn estimated_size(&self) -> usize {
        self.family.len() + self.qualifier.len()
    }
}

impl Display for Column {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family, self.qualifier)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cell {
    pub row: Vec<u8>,
    pub column: Column,
    pub timestamp: Millis,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnUpdate {
    Put { column: Column, value: Vec<u8>, timestamp: Option<Millis> },
    Delete { column: Column },
}

impl ColumnUpdate {
    pub fn column(&self) -> &Column {
        match self {
            Self::Put { column, .. } => column,
            Self::Delete { column } => column,
        }
    }
}

/// Ordered column updates to a single row, applied atomically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutation {
    row: Vec<u8>,
    updates: Vec<ColumnUpdate>,
}

impl Mutation {
    pub fn new(row: impl Into<Vec<u8>>) -> Self {
        Self { row: row.into(), updates: Vec::new() }
    }

    pub fn row(&self) -> &[u8] {
        &self.row
    }

    pub fn updates(&self) -> &[ColumnUpdate] {
        &self.updates
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn put(&mut self, column: Column, value: impl Into<Vec<u8>>) {
        self.updates.push(ColumnUpdate::Put { column, value: value.into(), timestamp: None });
    }

    pub fn put_at(&mut self, column: Column, value: impl Into<Vec<u8>>, timestamp: Millis) {
        self.updates.push(ColumnUpdate::Put { column, value: value.into(), timestamp: Some(timestamp) });
    }

    pub fn delete(&mut self, column: Column) {
        self.updates.push(ColumnUpdate::Delete { column });
    }

    /// Value put to given column in this mutation.
    pub fn value_of(&self, column: &Column) -> Option<&[u8]> {
        self.updates.iter().rev().find_map(|update| match update {
            ColumnUpdate::Put { column: put, value, .. } if put == column => Some(value.as_slice()),
            _ => None,
        })
    }

    pub fn estimated_size(&self) -> usize {
        let updates: usize = self
            .updates
            .iter()
            .map(|update| match update {
                ColumnUpdate::Put { column, value, .. } => column.estimated_size() + value.len() + 8,
                ColumnUpdate::Delete { column } => column.estimated_size(),
            })
            .sum();
        self.row.len() + updates
    }
}

/// Row range to scan, restricted to given column families if any.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanRange {
    pub start: Bound<Vec<u8>>,
    pub end: Bound<Vec<u8>>,
    pub families: Vec<CompactString>,
}

impl ScanRange {
    pub fn new((start, end): (Bound<Vec<u8>>, Bound<Vec<u8>>)) -> Self {
        Self { start, end, families: Vec::new() }
    }

    pub fn row(row: impl Into<Vec<u8>>) -> Self {
        let row = row.into();
        Self::new((Bound::Included(row.clone()), Bound::Included(row)))
    }

    pub fn with_families<I, S>(self, families: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CompactString>, {
        Self { families: families.into_iter().map(Into::into).collect(), ..self }
    }

    pub fn contains_family(&self, family: &str) -> bool {
        self.families.is_empty() || self.families.iter().any(|f| *f == family)
    }
}

/// Cells of one row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowCells {
    pub row: Vec<u8>,
    pub cells: Vec<Cell>,
}

impl RowCells {
    pub fn get(&self, column: &Column) -> Option<&Cell> {
        self.cells.iter().find(|cell| &cell.column == column)
    }

    pub fn family<'a>(&'a self, family: &'a str) -> impl Iterator<Item = &'a Cell> + 'a {
        self.cells.iter().filter(move |cell| cell.column.family == family)
    }
}

/// Groups row sorted cells by row.
pub fn group_rows(cells: Vec<Cell>) -> Vec<RowCells> {
    let mut rows: Vec<RowCells> = Vec::new();
    for cell in cells {
        match rows.last_mut() {
            Some(last) if last.row == cell.row => last.cells.push(cell),
            _ => rows.push(RowCells { row: cell.row.clone(), cells: vec![cell] }),
        }
    }
    rows
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Applies all updates of mutation atomically.
    ///
    /// Mutation carrying [LOCK_COLUMN] is rejected with [crate::MetaError::ConstraintViolation] if that lock is
    /// not held at apply time. [LOCK_COLUMN] itself is never stored.
    async fn apply(&self, mutation: &Mutation) -> Result<()>;

    /// Cells in range, sorted by row and then column.
    async fn scan(&self, range: &ScanRange) -> Result<Vec<Cell>>;
}
