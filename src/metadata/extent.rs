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

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};

use compact_str::CompactString;

use super::schema::PREV_ROW_COLUMN;
use crate::error::{MetaError, Result};
use crate::keys::{self, METADATA_TABLE_ID};
use crate::store::{Mutation, ScanRange};

/// Row range of one tablet: rows after `prev_end_row` up to and including `end_row`.
///
/// Absent `prev_end_row` means start of table, absent `end_row` means end of table.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Extent {
    table: CompactString,
    prev_end_row: Option<Vec<u8>>,
    end_row: Option<Vec<u8>>,
}

impl Extent {
    pub fn new(table: impl Into<CompactString>, prev_end_row: Option<&[u8]>, end_row: Option<&[u8]>) -> Result<Self> {
        let table = table.into();
        if let (Some(prev), Some(end)) = (prev_end_row, end_row) {
            if prev >= end {
                return Err(MetaError::invalid_argument(format!(
                    "extent of table {table} has prev end row {:?} not before end row {:?}",
                    String::from_utf8_lossy(prev),
                    String::from_utf8_lossy(end)
                )));
            }
        }
        Ok(Self { table, prev_end_row: prev_end_row.map(<[u8]>::to_vec), end_row: end_row.map(<[u8]>::to_vec) })
    }

    /// Single tablet of the metadata table, described in coordination service.
    pub fn root() -> Self {
        let end_row = keys::tablet_row(METADATA_TABLE_ID, None);
        Self { table: CompactString::new_inline(METADATA_TABLE_ID), prev_end_row: None, end_row: Some(end_row) }
    }

    /// Extent of tablet keyed by `row` in metadata store.
    pub fn from_metadata_row(row: &[u8], prev_end_row: Option<&[u8]>) -> Result<Self> {
        let (table, end_row) = keys::decode_tablet_row(row)?;
        Self::new(table, prev_end_row, end_row)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn prev_end_row(&self) -> Option<&[u8]> {
        self.prev_end_row.as_deref()
    }

    pub fn end_row(&self) -> Option<&[u8]> {
        self.end_row.as_deref()
    }

    pub fn is_root(&self) -> bool {
        *self == Self::root()
    }

    pub fn is_metadata(&self) -> bool {
        self.table == METADATA_TABLE_ID
    }

    pub fn metadata_row(&self) -> Vec<u8> {
        keys::tablet_row(&self.table, self.end_row())
    }

    pub fn metadata_range(&self) -> ScanRange {
        ScanRange::row(self.metadata_row())
    }

    /// Mutation creating or updating prev row column of this extent.
    pub fn prev_row_mutation(&self) -> Mutation {
        let mut mutation = Mutation::new(self.metadata_row());
        mutation.put(PREV_ROW_COLUMN, encode_prev_row(self.prev_end_row()));
        mutation
    }
}

/// Compares end rows with absent one as positive infinity.
pub fn compare_end_rows(a: Option<&[u8]>, b: Option<&[u8]>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.cmp(b),
    }
}

impl Ord for Extent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.table
            .cmp(&other.table)
            .then_with(|| compare_end_rows(self.end_row(), other.end_row()))
            .then_with(|| self.prev_end_row().cmp(&other.prev_end_row()))
    }
}

impl PartialOrd for Extent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Extent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.end_row() {
            None => write!(f, "{}<", self.table)?,
            Some(end_row) => write!(f, "{};{}", self.table, String::from_utf8_lossy(end_row))?,
        }
        match self.prev_end_row() {
            None => f.write_str("<"),
            Some(prev_end_row) => write!(f, "<{}", String::from_utf8_lossy(prev_end_row)),
        }
    }
}

/// Encodes prev row as flag byte, 0 for absent and 1 for present, followed by row bytes.
pub fn encode_prev_row(prev_end_row: Option<&[u8]>) -> Vec<u8> {
    match prev_end_row {
        None => vec![0],
        Some(row) => {
            let mut bytes = Vec::with_capacity(row.len() + 1);
            bytes.push(1);
            bytes.extend_from_slice(row);
            bytes
        },
    }
}

pub fn decode_prev_row(bytes: &[u8]) -> Result<Option<&[u8]>> {
    match bytes.split_first() {
        Some((0, [])) => Ok(None),
        Some((1, row)) => Ok(Some(row)),
        _ => Err(MetaError::corrupted(format!("malformed prev row encoding {bytes:?}"))),
    }
}
