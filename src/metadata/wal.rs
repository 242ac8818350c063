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

use std::fmt::{self, Display, Formatter};

use bytes::{Buf, BufMut};

use super::extent::Extent;
use super::schema::LOG_FAMILY;
use crate::clock::Millis;
use crate::error::{MetaError, Result};
use crate::store::{Cell, Column};
use crate::utils::split_pair;

/// Reference from a tablet to a write-ahead log holding its unflushed mutations.
///
/// Logs written together form a log set. A log set is recorded durably under exactly one of its names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub extent: Extent,
    pub timestamp: Millis,
    pub server: String,
    pub filename: String,
    pub tablet_id: u8,
    pub log_set: Vec<String>,
}

/// File name part of a `server/file` log name.
pub fn log_file_name(name: &str) -> &str {
    name.rsplit_once('/').map(|(_, filename)| filename).unwrap_or(name)
}

impl LogEntry {
    /// Name in form `server/filename`.
    pub fn name(&self) -> String {
        format!("{}/{}", self.server, self.filename)
    }

    pub fn column(&self) -> Column {
        Column::new(LOG_FAMILY, self.name())
    }

    /// Whether this entry records log set containing log `name`, matched by file name.
    pub fn covers(&self, name: &str) -> bool {
        let filename = log_file_name(name);
        self.filename == filename || self.log_set.iter().any(|log| log_file_name(log) == filename)
    }

    /// Column value: log set joined by `;` followed by `|` and tablet id.
    pub fn to_value(&self) -> String {
        format!("{}|{}", self.log_set.join(";"), self.tablet_id)
    }

    /// Parses entry from log column of tablet `extent`, timestamp of entry is cell timestamp.
    pub fn from_cell(extent: &Extent, cell: &Cell) -> Result<Self> {
        let corrupted = |message: String| {
            MetaError::corrupted(format!("log column {} of {extent}: {message}", cell.column))
        };
        let (server, filename) = split_pair(&cell.column.qualifier, '/', "log name").map_err(corrupted)?;
        let value = std::str::from_utf8(&cell.value).map_err(|_| corrupted("non utf8 value".to_string()))?;
        let (log_set, tablet_id) = value.rsplit_once('|').ok_or_else(|| corrupted(format!("value {value:?}")))?;
        let tablet_id = tablet_id.parse().map_err(|_| corrupted(format!("tablet id {tablet_id:?}")))?;
        Ok(Self {
            extent: extent.clone(),
            timestamp: cell.timestamp,
            server: server.to_string(),
            filename: filename.to_string(),
            tablet_id,
            log_set: log_set.split(';').map(ToString::to_string).collect(),
        })
    }

    /// Serializes entry for a node in coordination service.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.log_set.len() > u8::MAX as usize {
            return Err(MetaError::invalid_argument(format!(
                "log set of {} has {} logs, at most {} are encodable",
                self.name(),
                self.log_set.len(),
                u8::MAX
            )));
        }
        let mut buf = Vec::new();
        put_bytes(&mut buf, self.extent.table().as_bytes())?;
        put_optional_bytes(&mut buf, self.extent.end_row())?;
        put_optional_bytes(&mut buf, self.extent.prev_end_row())?;
        buf.put_u64(self.timestamp);
        put_bytes(&mut buf, self.server.as_bytes())?;
        put_bytes(&mut buf, self.filename.as_bytes())?;
        buf.put_u8(self.tablet_id);
        buf.put_u8(self.log_set.len() as u8);
        for log in self.log_set.iter() {
            put_bytes(&mut buf, log.as_bytes())?;
        }
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader { buf: bytes };
        let table = reader.get_string()?;
        let end_row = reader.get_optional_bytes()?;
        let prev_end_row = reader.get_optional_bytes()?;
        let extent = Extent::new(table, prev_end_row, end_row)
            .map_err(|err| MetaError::corrupted(format!("log entry with invalid extent: {err}")))?;
        let timestamp = reader.get_u64()?;
        let server = reader.get_string()?;
        let filename = reader.get_string()?;
        let tablet_id = reader.get_u8()?;
        let count = reader.get_u8()?;
        let log_set = (0..count).map(|_| reader.get_string().map(ToString::to_string)).collect::<Result<Vec<_>>>()?;
        if reader.buf.has_remaining() {
            return Err(MetaError::corrupted(format!("log entry with {} trailing bytes", reader.buf.remaining())));
        }
        Ok(Self { extent, timestamp, server: server.to_string(), filename: filename.to_string(), tablet_id, log_set })
    }
}

impl Display for LogEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.extent, self.filename, self.tablet_id)
    }
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    let Ok(len) = u16::try_from(bytes.len()) else {
        return Err(MetaError::invalid_argument(format!("{} bytes exceed encodable length {}", bytes.len(), u16::MAX)));
    };
    buf.put_u16(len);
    buf.put_slice(bytes);
    Ok(())
}

fn put_optional_bytes(buf: &mut Vec<u8>, bytes: Option<&[u8]>) -> Result<()> {
    match bytes {
        None => buf.put_u8(0),
        Some(bytes) => {
            buf.put_u8(1);
            put_bytes(buf, bytes)?;
        },
    }
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn ensure(&self, n: usize) -> Result<()> {
        match self.buf.remaining() >= n {
            true => Ok(()),
            false => Err(MetaError::corrupted(format!("truncated log entry, expect {n} more bytes"))),
        }
    }

    fn get_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    fn get_u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    fn get_bytes(&mut self) -> Result<&'a [u8]> {
        self.ensure(2)?;
        let len = self.buf.get_u16() as usize;
        self.ensure(len)?;
        let (bytes, remaining) = self.buf.split_at(len);
        self.buf = remaining;
        Ok(bytes)
    }

    fn get_optional_bytes(&mut self) -> Result<Option<&'a [u8]>> {
        match self.get_u8()? {
            0 => Ok(None),
            1 => self.get_bytes().map(Some),
            flag => Err(MetaError::corrupted(format!("invalid presence flag {flag} in log entry"))),
        }
    }

    fn get_string(&mut self) -> Result<&'a str> {
        let bytes = self.get_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| MetaError::corrupted("non utf8 string in log entry"))
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    fn root_entry(log_set: &[&str]) -> LogEntry {
        LogEntry {
            extent: Extent::root(),
            timestamp: 1234,
            server: "host:9997".to_string(),
            filename: "wal1".to_string(),
            tablet_id: 2,
            log_set: log_set.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_bytes() {
        let entry = root_entry(&["host:9997/wal1", "host:9998/wal2"]);
        let bytes = entry.to_bytes().unwrap();
        assert_that!(LogEntry::from_bytes(&bytes).unwrap()).is_equal_to(entry.clone());

        let user_entry = LogEntry { extent: Extent::new("1", Some(b"a".as_slice()), None).unwrap(), ..entry };
        let bytes = user_entry.to_bytes().unwrap();
        assert_that!(LogEntry::from_bytes(&bytes).unwrap()).is_equal_to(user_entry);
    }

    #[test]
    fn test_bytes_layout() {
        let entry = LogEntry { log_set: vec![], ..root_entry(&[]) };
        let bytes = entry.to_bytes().unwrap();
        // table, end row, absent prev row
        let mut expected = b"\x00\x02!0\x01\x00\x06!0;!0<\x00".to_vec();
        expected.extend_from_slice(&1234u64.to_be_bytes());
        expected.extend_from_slice(b"\x00\x09host:9997\x00\x04wal1\x02\x00");
        assert_that!(bytes).is_equal_to(expected);
    }

    #[test]
    fn test_bytes_overflow() {
        let names: Vec<String> = (0..256).map(|i| format!("host:9997/wal{i}")).collect();
        let entry = LogEntry { log_set: names, ..root_entry(&[]) };
        assert!(matches!(entry.to_bytes().unwrap_err(), MetaError::InvalidArgument { .. }));

        let entry = LogEntry { server: "h".repeat(65536), ..root_entry(&[]) };
        assert!(matches!(entry.to_bytes().unwrap_err(), MetaError::InvalidArgument { .. }));

        let names: Vec<String> = (0..255).map(|i| format!("host:9997/wal{i}")).collect();
        let entry = LogEntry { log_set: names, ..root_entry(&[]) };
        assert_that!(LogEntry::from_bytes(&entry.to_bytes().unwrap()).unwrap().log_set).has_length(255);
    }

    #[test]
    fn test_bytes_corrupted() {
        let bytes = root_entry(&["wal1"]).to_bytes().unwrap();
        assert!(LogEntry::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err().is_corruption());
        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(LogEntry::from_bytes(&trailing).unwrap_err().is_corruption());
    }

    #[test]
    fn test_cell() {
        let extent = Extent::new("1", None, Some(b"m".as_slice())).unwrap();
        let entry = LogEntry { extent: extent.clone(), ..root_entry(&["host:9997/wal1", "host:9998/wal2"]) };
        let value = entry.to_value().into_bytes();
        let cell = Cell { row: extent.metadata_row(), column: entry.column(), timestamp: 1234, value };
        assert_that!(cell.column.to_string()).is_equal_to("log:host:9997/wal1".to_string());
        assert_that!(entry.to_value()).is_equal_to("host:9997/wal1;host:9998/wal2|2".to_string());
        assert_that!(LogEntry::from_cell(&extent, &cell).unwrap()).is_equal_to(entry);

        let cell = Cell { value: b"wal1".to_vec(), ..cell };
        assert!(LogEntry::from_cell(&extent, &cell).unwrap_err().is_corruption());
    }

    #[test]
    fn test_covers() {
        let entry = root_entry(&["host:9997/wal1", "host:9998/wal2"]);
        assert_that!(entry.covers("host:9998/wal2")).is_true();
        assert_that!(entry.covers("wal2")).is_true();
        assert_that!(entry.covers("host:9997/wal3")).is_false();
    }
}
