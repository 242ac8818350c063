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

//! Row keys of the metadata store.
//!
//! Tablet rows are `table ';' end_row`, or `table '<'` for the last tablet of a table. As `';' < '<'`, the
//! last tablet sorts after every other tablet of its table.

use std::ops::Bound;

use crate::error::{MetaError, Result};

/// Id of the metadata table itself.
pub const METADATA_TABLE_ID: &str = "!0";

pub const END_ROW_DELIMITER: u8 = b';';
pub const LAST_TABLET_MARKER: u8 = b'<';

/// Tombstones for files of user tables.
pub const DELETE_FLAG_PREFIX: &str = "~del";
/// Tombstones for files of the metadata table.
pub const METADATA_DELETE_FLAG_PREFIX: &str = "!!~del";
/// Bulk load in progress flags.
pub const BULK_LOAD_FLAG_PREFIX: &str = "~blip";

pub fn tablet_row(table: &str, end_row: Option<&[u8]>) -> Vec<u8> {
    let n = table.len() + 1 + end_row.map(|row| row.len()).unwrap_or(0);
    let mut row = Vec::with_capacity(n);
    row.extend_from_slice(table.as_bytes());
    match end_row {
        None => row.push(LAST_TABLET_MARKER),
        Some(end_row) => {
            row.push(END_ROW_DELIMITER);
            row.extend_from_slice(end_row);
        },
    }
    row
}

/// Splits tablet row into table id and end row.
pub fn decode_tablet_row(row: &[u8]) -> Result<(&str, Option<&[u8]>)> {
    let Some(i) = row.iter().position(|b| *b == END_ROW_DELIMITER || *b == LAST_TABLET_MARKER) else {
        return Err(MetaError::corrupted(format!("tablet row {:?} has no delimiter", String::from_utf8_lossy(row))));
    };
    let table = std::str::from_utf8(&row[..i]).map_err(|_| {
        MetaError::corrupted(format!("tablet row {:?} has non utf8 table", String::from_utf8_lossy(row)))
    })?;
    match row[i] {
        END_ROW_DELIMITER => Ok((table, Some(&row[i + 1..]))),
        _ if i + 1 == row.len() => Ok((table, None)),
        _ => Err(MetaError::corrupted(format!("tablet row {:?} has trailing bytes", String::from_utf8_lossy(row)))),
    }
}

/// Row bounds covering all tablets of given table.
pub fn table_bounds(table: &str) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let mut start = Vec::with_capacity(table.len() + 1);
    start.extend_from_slice(table.as_bytes());
    start.push(END_ROW_DELIMITER);
    (Bound::Included(start), Bound::Included(tablet_row(table, None)))
}

/// Bounds covering all rows starting with given prefix.
pub fn prefix_bounds(prefix: &[u8]) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let start = Bound::Included(prefix.to_vec());
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last != 0xff {
            end.push(last + 1);
            return (start, Bound::Excluded(end));
        }
    }
    (start, Bound::Unbounded)
}

pub fn delete_flag_prefix(table: &str) -> &'static str {
    match table == METADATA_TABLE_ID {
        true => METADATA_DELETE_FLAG_PREFIX,
        false => DELETE_FLAG_PREFIX,
    }
}

/// Row of tombstone for file `path` owned by or referenced from `table`.
///
/// Relative paths as `../2/t-0001/F0001.rf` address files of other tables and keep their table part.
pub fn delete_flag_row(table: &str, path: &str) -> Vec<u8> {
    let prefix = delete_flag_prefix(table);
    let mut row = String::with_capacity(prefix.len() + table.len() + path.len() + 1);
    row.push_str(prefix);
    match path.strip_prefix("..") {
        Some(relative) if path.starts_with("../") => row.push_str(relative),
        _ => {
            row.push('/');
            row.push_str(table);
            row.push_str(path);
        },
    }
    row.into_bytes()
}

pub fn bulk_load_flag_row(path: &str) -> Vec<u8> {
    let mut row = String::with_capacity(BULK_LOAD_FLAG_PREFIX.len() + path.len());
    row.push_str(BULK_LOAD_FLAG_PREFIX);
    row.push_str(path);
    row.into_bytes()
}

#[cfg(test)]
mod tests {
    use std::ops::Bound;

    use assertor::*;
    use test_case::test_case;

    use super::*;

    #[test_case("1", Some(b"m".as_slice()), b"1;m"; "bounded")]
    #[test_case("1", None, b"1<"; "last")]
    #[test_case("!0", Some(b"!0<".as_slice()), b"!0;!0<"; "root")]
    fn test_tablet_row(table: &str, end_row: Option<&[u8]>, expected: &[u8]) {
        let row = tablet_row(table, end_row);
        assert_that!(row.as_slice()).is_equal_to(expected);
        assert_that!(decode_tablet_row(&row).unwrap()).is_equal_to((table, end_row));
    }

    #[test]
    fn test_tablet_row_order() {
        let rows = [
            tablet_row("1", Some(b"a".as_slice())),
            tablet_row("1", Some(b"ab".as_slice())),
            tablet_row("1", Some(b"b".as_slice())),
            tablet_row("1", None),
        ];
        for pair in rows.windows(2) {
            assert_that!(pair[0]).is_less_than(pair[1].clone());
        }
    }

    #[test]
    fn test_decode_tablet_row_invalid() {
        assert!(decode_tablet_row(b"1").unwrap_err().is_corruption());
        assert!(decode_tablet_row(b"1<x").unwrap_err().is_corruption());
    }

    #[test]
    fn test_table_bounds() {
        let (start, end) = table_bounds("1");
        assert_that!(start).is_equal_to(Bound::Included(b"1;".to_vec()));
        assert_that!(end).is_equal_to(Bound::Included(b"1<".to_vec()));
    }

    #[test]
    fn test_prefix_bounds() {
        let bounds = (Bound::Included(b"~del".to_vec()), Bound::Excluded(b"~dem".to_vec()));
        assert_that!(prefix_bounds(b"~del")).is_equal_to(bounds);
        let bounds = (Bound::Included(vec![b'a', 0xff]), Bound::Excluded(b"b".to_vec()));
        assert_that!(prefix_bounds(&[b'a', 0xff])).is_equal_to(bounds);
    }

    #[test_case("1", "/t-0001/F0001.rf", "~del/1/t-0001/F0001.rf"; "own file")]
    #[test_case("3", "../2/t-0001/F0001.rf", "~del/2/t-0001/F0001.rf"; "foreign file")]
    #[test_case("!0", "/table_info/F0001.rf", "!!~del/!0/table_info/F0001.rf"; "metadata file")]
    fn test_delete_flag_row(table: &str, path: &str, expected: &str) {
        assert_that!(delete_flag_row(table, path)).is_equal_to(expected.as_bytes().to_vec());
    }

    #[test]
    fn test_bulk_load_flag_row() {
        assert_that!(bulk_load_flag_row("/2/b-0001")).is_equal_to(b"~blip/2/b-0001".to_vec());
    }
}
