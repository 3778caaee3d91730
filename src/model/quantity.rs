//! Kubernetes resource quantity parsing
//!
//! Only the forms used for container CPU and memory are accepted: CPU as cores
//! (`"1"`, `"0.5"`) or millicores (`"250m"`), memory as plain bytes or with a
//! binary (`Ki`..`Ei`) or decimal (`k`..`E`) suffix.

/// Binary and decimal memory suffixes with their multipliers
const MEMORY_SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Parse a CPU quantity into millicores
pub fn parse_cpu_millis(qty: &str) -> Result<u64, String> {
    let qty = qty.trim();
    if let Some(millis) = qty.strip_suffix('m') {
        return millis
            .parse::<u64>()
            .map_err(|_| format!("invalid cpu quantity '{qty}' (expected e.g. '100m', '1', '0.5')"));
    }

    match qty.parse::<f64>() {
        Ok(cores) if cores.is_finite() && cores >= 0.0 => Ok((cores * 1000.0).round() as u64),
        _ => Err(format!(
            "invalid cpu quantity '{qty}' (expected e.g. '100m', '1', '0.5')"
        )),
    }
}

/// Parse a memory quantity into bytes
pub fn parse_memory_bytes(qty: &str) -> Result<u64, String> {
    let qty = qty.trim();
    let invalid = || format!("invalid memory quantity '{qty}' (expected e.g. '128Mi', '1Gi')");

    // Binary suffixes are checked first so "Mi" is not read as "M" + garbage
    if let Some((suffix, multiplier)) = MEMORY_SUFFIXES.iter().find(|(s, _)| qty.ends_with(s)) {
        let prefix = &qty[..qty.len() - suffix.len()];
        let value = prefix.parse::<f64>().map_err(|_| invalid())?;
        if !value.is_finite() || value < 0.0 {
            return Err(invalid());
        }
        return Ok((value * multiplier).round() as u64);
    }

    qty.parse::<u64>().map_err(|_| invalid())
}
