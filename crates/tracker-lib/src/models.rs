//! Core data models shared by the reconciler and the persistence port.

use serde::{Deserialize, Serialize};

/// A claim mount declared by a container: the claim is referenced by name,
/// not uid, and may not exist yet when the pod is observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRef {
    pub claim_name: String,
    pub read_only: bool,
}

/// The parts of a container the tracker persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDesc {
    pub name: String,
    pub image: String,
    pub command: String,
    pub claim_mounts: Vec<MountRef>,
}

/// Storage backend families a persistent volume can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    Nfs,
    Iscsi,
}

/// Joins a container command vector the way it is persisted.
pub fn join_command(command: &[String]) -> String {
    command.join(" ")
}

/// Joins access modes into the comma-separated form stored in the backend.
pub fn join_access_modes(modes: &[String]) -> String {
    modes.join(",")
}

/// Parses a control-plane quantity string ("5Gi", "500M", "1048576") into
/// bytes. Binary (Ki..Ei) and decimal (k..E) suffixes are supported; "m"
/// (milli) rounds up to a whole byte. Returns None for anything that does
/// not look like a quantity.
pub fn parse_quantity(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    let multiplier: i64 = match suffix {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        "m" => {
            let v = number.parse::<i64>().ok()?;
            // Milli-quantities round up to a whole byte.
            return Some((v + 999) / 1000);
        }
        _ => return None,
    };

    if let Ok(v) = number.parse::<i64>() {
        return v.checked_mul(multiplier);
    }
    // Fractional mantissa ("1.5Gi"); falls back to float math.
    let f = number.parse::<f64>().ok()?;
    let bytes = f * multiplier as f64;
    if !bytes.is_finite() {
        return None;
    }
    Some(bytes.round() as i64)
}
