// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Host port allocation per node

use rand::Rng;
use std::collections::HashSet;

use super::store::{PanelData, ServerPort};
use crate::error::{AxisError, Result};

pub const PORT_MIN: u16 = 25565;
/// Exclusive
pub const PORT_MAX: u16 = 30000;
const RANDOM_ATTEMPTS: usize = 1000;

/// Host ports held by servers on `node_id`, optionally ignoring one server
pub fn used_ports(data: &PanelData, node_id: &str, except: Option<&str>) -> HashSet<u16> {
    data.servers_on_node(node_id)
        .filter(|s| Some(s.id.as_str()) != except)
        .flat_map(|s| s.ports.iter().map(|p| p.port))
        .collect()
}

/// Random free port, falling back to a linear sweep when the range is crowded
pub fn allocate_port(used: &HashSet<u16>) -> Option<u16> {
    let mut rng = rand::thread_rng();
    for _ in 0..RANDOM_ATTEMPTS {
        let port = rng.gen_range(PORT_MIN..PORT_MAX);
        if !used.contains(&port) {
            return Some(port);
        }
    }
    (PORT_MIN..PORT_MAX).find(|p| !used.contains(p))
}

/// `count` distinct ports; the first is primary
pub fn allocate_ports(used: &HashSet<u16>, count: usize) -> Result<Vec<ServerPort>> {
    let mut taken = used.clone();
    let mut ports = Vec::with_capacity(count);
    for i in 0..count {
        let port = allocate_port(&taken).ok_or_else(|| AxisError::conflict("No free ports left on this node"))?;
        taken.insert(port);
        ports.push(ServerPort { port, primary: i == 0 });
    }
    Ok(ports)
}
