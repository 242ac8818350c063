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

//! Columns of tablet rows and their typed view.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};

use compact_str::CompactString;

use super::datafile::{DataFileValue, DataFiles};
use super::extent::{decode_prev_row, Extent};
use super::wal::LogEntry;
use crate::cluster::LockId;
use crate::error::{MetaError, Result};
use crate::store::{Cell, Column, Mutation, RowCells};

pub const DIRECTORY_COLUMN: Column = Column::constant("srv", "dir");
pub const TIME_COLUMN: Column = Column::constant("srv", "time");
pub const FLUSH_COLUMN: Column = Column::constant("srv", "flush");
pub const COMPACT_COLUMN: Column = Column::constant("srv", "compact");
pub const PREV_ROW_COLUMN: Column = Column::constant("~tab", "~pr");
pub const SPLIT_RATIO_COLUMN: Column = Column::constant("~tab", "splitRatio");
pub const OLD_PREV_ROW_COLUMN: Column = Column::constant("~tab", "oldprevrow");
pub const CHOPPED_COLUMN: Column = Column::constant("chopped", "chopped");
pub const CLONED_COLUMN: Column = Column::constant(CLONED_FAMILY, "");
/// Sole column of flag rows such as delete markers.
pub const FLAG_COLUMN: Column = Column::constant("", "");

pub const DATAFILE_FAMILY: &str = "file";
pub const SCANFILE_FAMILY: &str = "scan";
pub const BULKFILE_FAMILY: &str = "loaded";
pub const LOG_FAMILY: &str = "log";
pub const CURRENT_LOCATION_FAMILY: &str = "loc";
pub const FUTURE_LOCATION_FAMILY: &str = "future";
pub const LAST_LOCATION_FAMILY: &str = "last";
pub const CLONED_FAMILY: &str = "!cloned";

/// Time type of tablets assigning logical time.
pub const LOGICAL_TIME: char = 'L';
/// Time type of tablets assigning wall clock time.
pub const MILLIS_TIME: char = 'M';

/// A tablet server process, identified by its address and lock session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerInstance {
    address: CompactString,
    session: CompactString,
}

impl ServerInstance {
    pub fn new(address: impl Into<CompactString>, session: impl Into<CompactString>) -> Self {
        Self { address: address.into(), session: session.into() }
    }

    /// Server at `address` serving under session of `lock`.
    pub fn from_lock(address: impl Into<CompactString>, lock: &LockId) -> Self {
        Self::new(address, lock.session_hex())
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    fn column(&self, family: &'static str) -> Column {
        Column::new(family, self.session.clone())
    }

    fn from_cell(cell: &Cell) -> Result<Self> {
        let address = std::str::from_utf8(&cell.value)
            .map_err(|_| MetaError::corrupted(format!("location {} has non utf8 address", cell.column)))?;
        Ok(Self::new(address, cell.column.qualifier.clone()))
    }

    pub fn put_location(&self, mutation: &mut Mutation) {
        mutation.put(self.column(CURRENT_LOCATION_FAMILY), self.address.as_bytes());
    }

    pub fn clear_location(&self, mutation: &mut Mutation) {
        mutation.delete(self.column(CURRENT_LOCATION_FAMILY));
    }

    pub fn put_future_location(&self, mutation: &mut Mutation) {
        mutation.put(self.column(FUTURE_LOCATION_FAMILY), self.address.as_bytes());
    }

    pub fn clear_future_location(&self, mutation: &mut Mutation) {
        mutation.delete(self.column(FUTURE_LOCATION_FAMILY));
    }

    pub fn put_last_location(&self, mutation: &mut Mutation) {
        mutation.put(self.column(LAST_LOCATION_FAMILY), self.address.as_bytes());
    }

    pub fn clear_last_location(&self, mutation: &mut Mutation) {
        mutation.delete(self.column(LAST_LOCATION_FAMILY));
    }
}

impl Display for ServerInstance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.address, self.session)
    }
}

pub(crate) fn utf8_value<'a>(cell: &'a Cell) -> Result<&'a str> {
    std::str::from_utf8(&cell.value).map_err(|_| {
        let row = String::from_utf8_lossy(&cell.row);
        MetaError::corrupted(format!("column {} of row {row:?} has non utf8 value", cell.column))
    })
}

pub(crate) fn decimal_value(cell: &Cell) -> Result<u64> {
    let value = utf8_value(cell)?;
    value.parse().map_err(|_| {
        let row = String::from_utf8_lossy(&cell.row);
        MetaError::corrupted(format!("column {} of row {row:?} has non decimal value {value:?}", cell.column))
    })
}

/// Typed view of one tablet row.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TabletMetadata {
    pub extent: Option<Extent>,
    pub dir: Option<String>,
    pub files: DataFiles,
    pub scans: BTreeSet<String>,
    pub bulk_loaded: BTreeMap<String, u64>,
    pub location: Option<ServerInstance>,
    pub future: Option<ServerInstance>,
    pub last: Option<ServerInstance>,
    pub flush_id: Option<u64>,
    pub compact_id: Option<u64>,
    pub time: Option<String>,
    pub split_ratio: Option<f64>,
    pub old_prev_row: Option<Option<Vec<u8>>>,
    pub chopped: bool,
    pub logs: Vec<LogEntry>,
    pub cloned: bool,
}

impl TabletMetadata {
    /// Parses tablet row, which must carry prev row column.
    pub fn from_row(row: &RowCells) -> Result<Self> {
        let prev_row = row.get(&PREV_ROW_COLUMN).ok_or_else(|| {
            MetaError::corrupted(format!("tablet row {:?} has no prev row", String::from_utf8_lossy(&row.row)))
        })?;
        let extent = Extent::from_metadata_row(&row.row, decode_prev_row(&prev_row.value)?)?;
        let mut tablet = Self::default();
        for cell in row.cells.iter() {
            let column = &cell.column;
            match column.family.as_str() {
                DATAFILE_FAMILY => {
                    tablet.files.insert(column.qualifier.to_string(), DataFileValue::decode(&cell.value)?);
                },
                SCANFILE_FAMILY => {
                    tablet.scans.insert(column.qualifier.to_string());
                },
                BULKFILE_FAMILY => {
                    tablet.bulk_loaded.insert(column.qualifier.to_string(), decimal_value(cell)?);
                },
                CURRENT_LOCATION_FAMILY => tablet.location = Some(ServerInstance::from_cell(cell)?),
                FUTURE_LOCATION_FAMILY => tablet.future = Some(ServerInstance::from_cell(cell)?),
                LAST_LOCATION_FAMILY => tablet.last = Some(ServerInstance::from_cell(cell)?),
                LOG_FAMILY => tablet.logs.push(LogEntry::from_cell(&extent, cell)?),
                CLONED_FAMILY => tablet.cloned = true,
                _ if *column == DIRECTORY_COLUMN => tablet.dir = Some(utf8_value(cell)?.to_string()),
                _ if *column == FLUSH_COLUMN => tablet.flush_id = Some(decimal_value(cell)?),
                _ if *column == COMPACT_COLUMN => tablet.compact_id = Some(decimal_value(cell)?),
                _ if *column == TIME_COLUMN => tablet.time = Some(utf8_value(cell)?.to_string()),
                _ if *column == CHOPPED_COLUMN => tablet.chopped = true,
                _ if *column == SPLIT_RATIO_COLUMN => tablet.split_ratio = Some(parse_split_ratio(cell)?),
                _ if *column == OLD_PREV_ROW_COLUMN => {
                    tablet.old_prev_row = Some(decode_prev_row(&cell.value)?.map(<[u8]>::to_vec));
                },
                _ => {},
            }
        }
        tablet.logs.sort_by_key(|entry| entry.timestamp);
        tablet.extent = Some(extent);
        Ok(tablet)
    }

    pub fn is_splitting(&self) -> bool {
        self.split_ratio.is_some() || self.old_prev_row.is_some()
    }
}

pub(crate) fn parse_split_ratio(cell: &Cell) -> Result<f64> {
    let value = utf8_value(cell)?;
    match value.parse::<f64>() {
        Ok(ratio) if (0.0..=1.0).contains(&ratio) => Ok(ratio),
        _ => {
            let row = String::from_utf8_lossy(&cell.row);
            Err(MetaError::corrupted(format!("tablet row {row:?} has invalid split ratio {value:?}")))
        },
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;
    use crate::metadata::extent::encode_prev_row;
    use crate::store::group_rows;

    fn cell(column: Column, value: impl Into<Vec<u8>>) -> Cell {
        Cell { row: b"1;m".to_vec(), column, timestamp: 5, value: value.into() }
    }

    #[test]
    fn test_server_instance() {
        let lock = LockId::new("/tm/tservers/host:9997", "zlock-0000000001", 0x1f2e);
        let server = ServerInstance::from_lock("host:9997", &lock);
        assert_that!(server.session()).is_equal_to("1f2e");
        assert_that!(server.to_string()).is_equal_to("host:9997[1f2e]".to_string());

        let mut mutation = Mutation::new("1;m");
        server.put_last_location(&mut mutation);
        server.clear_future_location(&mut mutation);
        let column = Column::new(LAST_LOCATION_FAMILY, "1f2e");
        assert_that!(mutation.value_of(&column)).is_equal_to(Some(b"host:9997".as_slice()));
        assert_that!(mutation.updates().len()).is_equal_to(2);
    }

    #[test]
    fn test_tablet_metadata() {
        let rows = group_rows(vec![
            cell(Column::new(DATAFILE_FAMILY, "/t-1/F1.rf"), DataFileValue::new(100, 10).encode()),
            cell(Column::new(LAST_LOCATION_FAMILY, "1f2e"), "host:9997"),
            cell(Column::new(LOG_FAMILY, "host:9997/wal1"), "host:9997/wal1|3"),
            cell(Column::new(BULKFILE_FAMILY, "/b-1/I1.rf"), "42"),
            cell(DIRECTORY_COLUMN, "/t-1"),
            cell(FLUSH_COLUMN, "7"),
            cell(TIME_COLUMN, "M100"),
            cell(PREV_ROW_COLUMN, encode_prev_row(Some(b"g".as_slice()))),
            cell(SPLIT_RATIO_COLUMN, "0.25"),
        ]);
        let tablet = TabletMetadata::from_row(&rows[0]).unwrap();
        let extent = Extent::new("1", Some(b"g".as_slice()), Some(b"m".as_slice())).unwrap();
        assert_that!(tablet.extent.clone()).is_equal_to(Some(extent));
        assert_that!(tablet.dir.clone()).is_equal_to(Some("/t-1".to_string()));
        assert_that!(tablet.files["/t-1/F1.rf"]).is_equal_to(DataFileValue::new(100, 10));
        assert_that!(tablet.bulk_loaded["/b-1/I1.rf"]).is_equal_to(42);
        assert_that!(tablet.last.clone()).is_equal_to(Some(ServerInstance::new("host:9997", "1f2e")));
        assert_that!(tablet.location.clone()).is_none();
        assert_that!(tablet.flush_id).is_equal_to(Some(7));
        assert_that!(tablet.time.clone()).is_equal_to(Some("M100".to_string()));
        assert_that!(tablet.logs).has_length(1);
        assert_that!(tablet.logs[0].tablet_id).is_equal_to(3);
        assert_that!(tablet.split_ratio).is_equal_to(Some(0.25));
        assert_that!(tablet.is_splitting()).is_true();
    }

    #[test]
    fn test_tablet_metadata_corrupted() {
        let rows = group_rows(vec![cell(DIRECTORY_COLUMN, "/t-1")]);
        assert!(TabletMetadata::from_row(&rows[0]).unwrap_err().is_corruption());

        let rows = group_rows(vec![cell(FLUSH_COLUMN, "x"), cell(PREV_ROW_COLUMN, encode_prev_row(None))]);
        assert!(TabletMetadata::from_row(&rows[0]).unwrap_err().is_corruption());
    }
}
