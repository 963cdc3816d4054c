use std::{
    collections::BTreeMap,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use bitvec::prelude::*;
use ipnet::Ipv4Net;
use log::{debug, warn};

use crate::error::{NetError, Result};

/// Bitmap offset claimed for a network's gateway.
pub const GATEWAY_OFFSET: usize = 0;

/// Offset 0 maps to the first address after the subnet base; the base
/// itself is never handed out.
const FIRST_HOST: u32 = 1;

/// Shortest prefix accepted. A /8 already holds ~16M hosts.
const MIN_PREFIX_LEN: u8 = 8;

/// Subnet allocator.
///
/// Every subnet is a fixed-size bitmap keyed by its canonical CIDR, one bit
/// per host address (`1` = allocated). The whole document is reloaded from
/// `path` before each mutation and rewritten after it, so callers must
/// serialize access to the same file.
#[derive(Debug)]
pub struct IPAM {
    path: PathBuf,
    subnets: BTreeMap<String, BitVec<u8>>,
}

impl IPAM {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            subnets: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hand out the lowest free address of `subnet`.
    pub fn allocate(&mut self, subnet: &Ipv4Net) -> Result<Ipv4Addr> {
        self.load()?;

        let (net, capacity) = canonical(subnet)?;
        let bitmap = self.bitmap_mut(&net, capacity);

        let offset = bitmap
            .first_zero()
            .ok_or_else(|| NetError::AllocationExhausted {
                subnet: net.to_string(),
            })?;
        bitmap.set(offset, true);

        self.dump()?;

        let ip = offset_to_ip(&net, offset);
        debug!("Allocated {ip} from {net}");
        Ok(ip)
    }

    /// Claim the gateway offset of `subnet`, falling back to the lowest free
    /// address when it is already taken.
    pub fn allocate_gateway(&mut self, subnet: &Ipv4Net) -> Result<Ipv4Addr> {
        self.load()?;

        let (net, capacity) = canonical(subnet)?;
        let bitmap = self.bitmap_mut(&net, capacity);

        let offset = if !bitmap[GATEWAY_OFFSET] {
            GATEWAY_OFFSET
        } else {
            let offset = bitmap
                .first_zero()
                .ok_or_else(|| NetError::AllocationExhausted {
                    subnet: net.to_string(),
                })?;
            warn!(
                "Gateway address of {net} is taken, using {} instead",
                offset_to_ip(&net, offset)
            );
            offset
        };
        bitmap.set(offset, true);

        self.dump()?;

        Ok(offset_to_ip(&net, offset))
    }

    /// Return `ip` to `subnet`. Releasing a free address changes nothing.
    pub fn release(&mut self, subnet: &Ipv4Net, ip: Ipv4Addr) -> Result<()> {
        self.load()?;

        let (net, capacity) = canonical(subnet)?;
        let offset = ip_to_offset(&net, capacity, ip)?;
        let bitmap = self.bitmap_mut(&net, capacity);

        if !bitmap[offset] {
            warn!("Releasing {ip} from {net}, but it was not allocated");
            return Ok(());
        }
        bitmap.set(offset, false);

        self.dump()?;

        debug!("Released {ip} to {net}");
        Ok(())
    }

    /// Whether `ip` is currently marked allocated, as of the last load.
    pub fn is_allocated(&self, subnet: &Ipv4Net, ip: Ipv4Addr) -> bool {
        let Ok((net, capacity)) = canonical(subnet) else {
            return false;
        };
        let Ok(offset) = ip_to_offset(&net, capacity, ip) else {
            return false;
        };

        self.subnets
            .get(&net.to_string())
            .and_then(|bitmap| bitmap.get(offset).map(|bit| *bit))
            .unwrap_or(false)
    }

    /// Replace the in-memory state with the persisted document.
    pub fn load(&mut self) -> Result<()> {
        if !self.path.exists() {
            self.subnets.clear();
            return Ok(());
        }

        let contents = std::fs::read(&self.path).map_err(|e| {
            NetError::persistence(
                format!("Failed to read {}", self.path.display()),
                Some(e.into()),
            )
        })?;

        let doc: BTreeMap<String, String> = serde_json::from_slice(&contents).map_err(|e| {
            NetError::persistence(
                format!("Failed to decode {}", self.path.display()),
                Some(e.into()),
            )
        })?;

        let mut subnets = BTreeMap::new();
        for (cidr, bits) in doc {
            let bitmap = decode_bitmap(&bits).ok_or_else(|| {
                NetError::persistence(format!("Corrupt allocation bitmap for {cidr}"), None)
            })?;
            subnets.insert(cidr, bitmap);
        }
        self.subnets = subnets;

        Ok(())
    }

    /// Rewrite the whole document.
    pub fn dump(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                NetError::persistence(
                    format!("Failed to create {}", parent.display()),
                    Some(e.into()),
                )
            })?;
        }

        let doc: BTreeMap<&String, String> = self
            .subnets
            .iter()
            .map(|(cidr, bitmap)| (cidr, encode_bitmap(bitmap)))
            .collect();

        let contents = serde_json::to_vec(&doc)
            .map_err(|e| NetError::persistence("Failed to encode allocations", Some(e.into())))?;

        std::fs::write(&self.path, contents).map_err(|e| {
            NetError::persistence(
                format!("Failed to write {}", self.path.display()),
                Some(e.into()),
            )
        })
    }

    fn bitmap_mut(&mut self, net: &Ipv4Net, capacity: usize) -> &mut BitVec<u8> {
        let bitmap = self
            .subnets
            .entry(net.to_string())
            .or_insert_with(|| bitvec![u8, Lsb0; 0; capacity]);

        if bitmap.len() != capacity {
            warn!(
                "Allocation bitmap of {net} has {} entries, expected {capacity}",
                bitmap.len()
            );
            bitmap.resize(capacity, false);
        }

        bitmap
    }
}

/// Parse a CIDR string. Host bits are allowed and kept.
pub fn parse_subnet(cidr: &str) -> Result<Ipv4Net> {
    cidr.parse::<Ipv4Net>()
        .map_err(|e| NetError::invalid_subnet(cidr, e))
}

/// Network-address form of `subnet` and its host capacity.
fn canonical(subnet: &Ipv4Net) -> Result<(Ipv4Net, usize)> {
    let net = subnet.trunc();
    let host_bits = 32 - u32::from(net.prefix_len());

    if host_bits < 2 {
        return Err(NetError::invalid_subnet(
            &net.to_string(),
            "prefix too long to hold a host address",
        ));
    }
    if net.prefix_len() < MIN_PREFIX_LEN {
        return Err(NetError::invalid_subnet(
            &net.to_string(),
            format!("prefix shorter than /{MIN_PREFIX_LEN}"),
        ));
    }

    // Network and broadcast addresses are excluded.
    let capacity = (1u64 << host_bits) - 2;
    Ok((net, capacity as usize))
}

fn offset_to_ip(net: &Ipv4Net, offset: usize) -> Ipv4Addr {
    let base = u32::from(net.network());
    Ipv4Addr::from(base + FIRST_HOST + offset as u32)
}

fn ip_to_offset(net: &Ipv4Net, capacity: usize, ip: Ipv4Addr) -> Result<usize> {
    let base = u32::from(net.network());
    let target = u32::from(ip);

    if !net.contains(&ip) || target < base + FIRST_HOST {
        return Err(NetError::invalid_subnet(
            &net.to_string(),
            format!("{ip} is not a host address of this subnet"),
        ));
    }

    let offset = (target - base - FIRST_HOST) as usize;
    if offset >= capacity {
        return Err(NetError::invalid_subnet(
            &net.to_string(),
            format!("{ip} is not a host address of this subnet"),
        ));
    }

    Ok(offset)
}

fn encode_bitmap(bitmap: &BitSlice<u8>) -> String {
    bitmap.iter().map(|bit| if *bit { '1' } else { '0' }).collect()
}

fn decode_bitmap(bits: &str) -> Option<BitVec<u8>> {
    bits.chars()
        .map(|c| match c {
            '0' => Some(false),
            '1' => Some(true),
            _ => None,
        })
        .collect()
}
