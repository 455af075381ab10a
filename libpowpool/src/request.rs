// Copyright 2023 Google LLC
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

/*! Parsing of textual signal and control request lists.

Two formats exist. Request files written by users name domains by
their string form, one request per line:

```text
CPU_FREQUENCY_STATUS cpu 0
BOARD_ENERGY board 0
```

The control plane hands the server a partitioned variant where each
line is tagged read or write and the domain is already an integer:

```text
read TIME 0 0
write BOARD_POWER_LIMIT_CONTROL 0 0
```

In both formats an empty line terminates parsing.
*/

use crate::{
    consts,
    error::{Error, Result},
    topo::Domain,
};

/// One signal or control to sample or adjust, pinned to a topology
/// domain instance. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub name: String,
    pub domain_type: i32,
    pub domain_idx: i32,
}

/// Parse the user facing `<name> <domain-name> <domain-idx>` format.
pub fn parse_requests(text: &str) -> Result<Vec<Request>> {
    let mut result = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            break;
        }
        let mut fields = line.split_whitespace();
        let (name, domain_name, idx_str) = match (fields.next(), fields.next(), fields.next()) {
            (Some(name), Some(domain), Some(idx)) => (name, domain, idx),
            _ => return Err(bad_line(line)),
        };
        let domain = Domain::from_name(domain_name)
            .map_err(|_| Error::Invalid(format!("unknown domain name '{domain_name}' in request line \"{line}\"")))?;
        let domain_idx =
            idx_str.parse::<i32>().ok().filter(|idx| *idx >= 0).ok_or_else(|| bad_line(line))?;
        result.push(Request {
            name: checked_name(name, line)?,
            domain_type: domain.type_id(),
            domain_idx,
        });
    }
    Ok(result)
}

/// Parse the control plane's `read|write <name> <domain-type>
/// <domain-idx>` format into signal and control lists.
pub fn parse_rw_requests(text: &str) -> Result<(Vec<Request>, Vec<Request>)> {
    let mut signal_config = Vec::new();
    let mut control_config = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            break;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(bad_line(line));
        }
        let is_read = fields[0] == "read";
        if !is_read && fields[0] != "write" {
            return Err(bad_line(line));
        }
        let domain_type = fields[2].parse::<i32>().map_err(|_| bad_line(line))?;
        let domain_idx = fields[3].parse::<i32>().map_err(|_| bad_line(line))?;
        let request = Request { name: checked_name(fields[1], line)?, domain_type, domain_idx };
        if is_read {
            signal_config.push(request);
        } else {
            control_config.push(request);
        }
    }
    Ok((signal_config, control_config))
}

fn checked_name(name: &str, line: &str) -> Result<String> {
    if name.len() >= consts::NAME_MAX {
        return Err(Error::Invalid(format!(
            "name is too long in request line \"{line}\""
        )));
    }
    Ok(name.to_string())
}

fn bad_line(line: &str) -> Error {
    Error::Invalid(format!("malformed request line \"{line}\""))
}
