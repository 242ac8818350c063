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

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use bytes::{Buf, BufMut};

use crate::error::{MetaError, Result};

/// Split ratios are applied in fixed point with nine decimal digits.
const RATIO_SCALE: u128 = 1_000_000_000;

/// Estimated size and entry count of one data file in one tablet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataFileValue {
    size: u64,
    entries: u64,
    time: Option<u64>,
}

impl DataFileValue {
    pub fn new(size: u64, entries: u64) -> Self {
        Self { size, entries, time: None }
    }

    pub fn with_time(self, time: u64) -> Self {
        Self { time: Some(time), ..self }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn time(&self) -> Option<u64> {
        self.time
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(24);
        bytes.put_u64(self.size);
        bytes.put_u64(self.entries);
        if let Some(time) = self.time {
            bytes.put_u64(time);
        }
        bytes
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 16 && bytes.len() != 24 {
            return Err(MetaError::corrupted(format!("data file value of {} bytes", bytes.len())));
        }
        let size = bytes.get_u64();
        let entries = bytes.get_u64();
        let time = bytes.has_remaining().then(|| bytes.get_u64());
        Ok(Self { size, entries, time })
    }

    /// Estimates of this file in lower and upper child of a split at `ratio`.
    ///
    /// Lower child takes floor and upper child takes the rest, so the two together cover whole file.
    pub fn split(&self, ratio: f64) -> (Self, Self) {
        let ratio = (ratio.clamp(0.0, 1.0) * RATIO_SCALE as f64).round() as u128;
        let low_size = (self.size as u128 * ratio / RATIO_SCALE) as u64;
        let low_entries = (self.entries as u128 * ratio / RATIO_SCALE) as u64;
        let low = Self { size: low_size, entries: low_entries, time: self.time };
        let high = Self { size: self.size - low_size, entries: self.entries - low_entries, time: self.time };
        (low, high)
    }
}

impl Display for DataFileValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.size, self.entries)?;
        if let Some(time) = self.time {
            write!(f, " {time}")?;
        }
        Ok(())
    }
}

pub type DataFiles = BTreeMap<String, DataFileValue>;

/// Splits estimates of all files between two children as every file spans the split row.
pub fn split_data_files(files: &DataFiles, ratio: f64) -> (DataFiles, DataFiles) {
    let mut low = DataFiles::new();
    let mut high = DataFiles::new();
    for (path, value) in files {
        let (low_value, high_value) = value.split(ratio);
        low.insert(path.clone(), low_value);
        high.insert(path.clone(), high_value);
    }
    (low, high)
}

#[cfg(test)]
mod tests {
    use assertor::*;
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_split_half() {
        let (low, high) = DataFileValue::new(100, 10).split(0.5);
        assert_that!(low).is_equal_to(DataFileValue::new(50, 5));
        assert_that!(high).is_equal_to(DataFileValue::new(50, 5));
    }

    #[test_case(100, 10, 0.0)]
    #[test_case(100, 10, 1.0)]
    #[test_case(101, 7, 0.5)]
    #[test_case(10, 3, 0.3)]
    #[test_case(u32::MAX as u64, 1, 0.999)]
    #[test_case(u64::MAX, u64::MAX, 0.5)]
    #[test_case(u64::MAX - 1, 1 << 60, 0.7)]
    fn test_split_covers_whole(size: u64, entries: u64, ratio: f64) {
        let value = DataFileValue::new(size, entries).with_time(7);
        let (low, high) = value.split(ratio);
        assert_that!(low.size() as u128 + high.size() as u128).is_equal_to(size as u128);
        assert_that!(low.entries() as u128 + high.entries() as u128).is_equal_to(entries as u128);
        assert!(low.size() <= size && high.size() <= size);
        assert!(low.entries() <= entries && high.entries() <= entries);
        assert_that!(low.time()).is_equal_to(Some(7));
        assert_that!(high.time()).is_equal_to(Some(7));
    }

    #[test]
    fn test_split_large_size_exact() {
        let size = (1u64 << 60) + 3;
        let (low, high) = DataFileValue::new(size, 10).split(0.7);
        assert_that!(low.size()).is_equal_to(((size as u128) * 7 / 10) as u64);
        assert_that!(high.size()).is_equal_to(size - low.size());
        assert_that!(low.entries()).is_equal_to(7);
        assert_that!(high.entries()).is_equal_to(3);
    }

    #[test]
    fn test_encoding() {
        let value = DataFileValue::new(1024, 3);
        let bytes = value.encode();
        assert_that!(bytes.len()).is_equal_to(16);
        assert_that!(DataFileValue::decode(&bytes).unwrap()).is_equal_to(value);

        let value = value.with_time(99);
        let bytes = value.encode();
        assert_that!(bytes.len()).is_equal_to(24);
        assert_that!(DataFileValue::decode(&bytes).unwrap()).is_equal_to(value);
        assert_that!(value.to_string()).is_equal_to("1024 3 99".to_string());
    }

    #[test]
    fn test_decode_corrupted() {
        assert!(DataFileValue::decode(b"1024,3").unwrap_err().is_corruption());
        assert!(DataFileValue::decode(&[0; 17]).unwrap_err().is_corruption());
    }

    #[test]
    fn test_split_data_files() {
        let mut files = DataFiles::new();
        files.insert("/t-1/F1.rf".to_string(), DataFileValue::new(100, 10));
        files.insert("/t-1/F2.rf".to_string(), DataFileValue::new(9, 3));
        let (low, high) = split_data_files(&files, 0.5);
        assert_that!(low["/t-1/F2.rf"]).is_equal_to(DataFileValue::new(4, 1));
        assert_that!(high["/t-1/F2.rf"]).is_equal_to(DataFileValue::new(5, 2));
        assert_that!(high["/t-1/F1.rf"]).is_equal_to(DataFileValue::new(50, 5));
    }
}
