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

use std::fmt::{self, Display, Formatter, Write as _};
use std::str::FromStr;

use anyhow::{anyhow, Error, Result};
use compact_str::CompactString;
use hashlink::LinkedHashMap;
use uriparse::{Authority, Query, Scheme, SchemeError, Segment};

/// Location of a service cluster and root path in it.
///
/// It has shape `scheme[+tls]://host1[:port1][,host2[:port2]][/root][?username=u&password=p]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceUri {
    scheme: CompactString,
    tls: bool,
    address: CompactString,
    root: CompactString,
    params: LinkedHashMap<CompactString, CompactString>,
}

fn split_param(s: &str) -> Option<(&str, &str)> {
    match s.split_once('=') {
        None | Some(("", _)) | Some((_, "")) => None,
        Some((_, value)) if value.contains('=') => None,
        Some(pair) => Some(pair),
    }
}

fn parse_params(s: &str) -> Option<LinkedHashMap<CompactString, CompactString>> {
    if Query::try_from(s).is_err() {
        return None;
    }
    let mut params = LinkedHashMap::with_capacity(s.matches('&').count() + 1);
    for param in s.split('&') {
        let (key, value) = split_param(param)?;
        if params.insert(CompactString::new(key), CompactString::new(value)).is_some() {
            return None;
        }
    }
    Some(params)
}

impl ServiceUri {
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Comma separated servers.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn servers(&self) -> impl Iterator<Item = &str> {
        self.address.split(',')
    }

    /// Root path of this instance, empty or with leading slash.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|value| value.as_str())
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.param("username"), self.param("password")) {
            (Some(username), Some(password)) => Some((username, password)),
            _ => None,
        }
    }
}

impl FromStr for ServiceUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<ServiceUri> {
        let Some((leading, trailing)) = s.split_once("://") else {
            return Err(anyhow!("invalid service uri: {s}"));
        };
        let (scheme, tls) = match leading.split_once('+') {
            Some((scheme, "tls")) => (scheme, true),
            Some(_) => return Err(anyhow!("unsupported transport in service uri: {s}")),
            None => (leading, false),
        };
        match Scheme::try_from(scheme) {
            Err(SchemeError::Empty) => return Err(anyhow!("no scheme in service uri: {s}")),
            Err(_) => return Err(anyhow!("invalid scheme in service uri: {s}")),
            Ok(_) => {},
        };

        let (address, trailing) = match trailing.find(['/', '?']) {
            None => (trailing, ""),
            Some(i) => (&trailing[..i], &trailing[i..]),
        };
        if address.is_empty() {
            return Err(anyhow!("no address in service uri: {s}"));
        }
        match Authority::try_from(address) {
            Ok(authority) if !authority.has_username() => {},
            Ok(_) => return Err(anyhow!("username in service uri address, use params instead: {s}")),
            Err(_) => return Err(anyhow!("invalid address in service uri: {s}")),
        }

        let (root, params) = match trailing.split_once('?') {
            Some((_, "")) => return Err(anyhow!("empty params in service uri: {s}")),
            Some((root, params)) => {
                (root, parse_params(params).ok_or_else(|| anyhow!("invalid params in service uri: {s}"))?)
            },
            None => (trailing, LinkedHashMap::new()),
        };
        if root.ends_with('/') || root.split('/').any(|segment| Segment::try_from(segment).is_err()) {
            return Err(anyhow!("invalid root path in service uri: {s}"));
        }
        Ok(ServiceUri { scheme: scheme.into(), tls, address: address.into(), root: root.into(), params })
    }
}

impl Display for ServiceUri {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.scheme)?;
        if self.tls {
            f.write_str("+tls")?;
        }
        f.write_str("://")?;
        f.write_str(&self.address)?;
        f.write_str(&self.root)?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            f.write_char(if i == 0 { '?' } else { '&' })?;
            f.write_str(key)?;
            f.write_char('=')?;
            f.write_str(value)?;
        }
        Ok(())
    }
}
