use serde::{Deserialize, Serialize};

/// A resource quantity in the Kubernetes string form ("500Mi", "1500m", "2").
///
/// The string is kept verbatim; arithmetic goes through [`Quantity::to_f64`],
/// which converts to base units (bytes for memory, cores for CPU). Invalid
/// strings surface as `Err`, never as a panic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Quantity(pub String);

// Binary suffixes before decimal ones so "Mi" is not read as milli.
const SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("K", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

impl Quantity {
    pub fn new(value: impl Into<String>) -> Self {
        Quantity(value.into())
    }

    /// Builds a quantity from a whole number of mebibytes ("16384Mi").
    pub fn from_mebibytes(mebibytes: u64) -> Self {
        Quantity(format!("{}Mi", mebibytes))
    }

    /// Builds a quantity from a whole number of cores ("8").
    pub fn from_cores(cores: u64) -> Self {
        Quantity(cores.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Converts to base units: bytes for memory quantities, cores for CPU.
    pub fn to_f64(&self) -> Result<f64, String> {
        let s = self.0.trim();
        if s.is_empty() {
            return Err("empty quantity".to_string());
        }

        let split = s
            .find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-' && c != '+')
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);

        let multiplier = if suffix.is_empty() {
            1.0
        } else {
            SUFFIXES
                .iter()
                .find(|(name, _)| *name == suffix)
                .map(|(_, m)| *m)
                .ok_or_else(|| format!("invalid quantity suffix {:?} in {:?}", suffix, s))?
        };

        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid quantity value {:?} in {:?}", number, s))?;

        Ok(value * multiplier)
    }

    /// Base-unit value scaled by a factor; the fraction math for capacity
    /// allocations.
    pub fn scale(&self, factor: f64) -> Result<f64, String> {
        Ok(self.to_f64()? * factor)
    }

    /// Compares two quantities across units.
    pub fn cmp(&self, other: &Quantity) -> Result<std::cmp::Ordering, String> {
        let (a, b) = (self.to_f64()?, other.to_f64()?);
        const EPSILON: f64 = 1e-9;
        if (a - b).abs() < EPSILON {
            Ok(std::cmp::Ordering::Equal)
        } else if a < b {
            Ok(std::cmp::Ordering::Less)
        } else {
            Ok(std::cmp::Ordering::Greater)
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self.to_f64(), Ok(v) if v == 0.0)
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Quantity {
    fn from(value: &str) -> Self {
        Quantity(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_parses_binary_suffixes() {
        assert_eq!(Quantity::from("1Ki").to_f64().unwrap(), 1024.0);
        assert_eq!(Quantity::from("500Mi").to_f64().unwrap(), 500.0 * 1_048_576.0);
        assert_eq!(Quantity::from("2Gi").to_f64().unwrap(), 2.0 * 1_073_741_824.0);
    }

    #[test]
    fn test_parses_decimal_suffixes() {
        assert_eq!(Quantity::from("1500m").to_f64().unwrap(), 1.5);
        assert_eq!(Quantity::from("2k").to_f64().unwrap(), 2000.0);
        assert_eq!(Quantity::from("3").to_f64().unwrap(), 3.0);
    }

    #[test]
    fn test_compares_across_units() {
        let a = Quantity::from("1Gi");
        let b = Quantity::from("1024Mi");
        assert_eq!(a.cmp(&b).unwrap(), Ordering::Equal);

        let small = Quantity::from("500m");
        let big = Quantity::from("1");
        assert_eq!(small.cmp(&big).unwrap(), Ordering::Less);
    }

    #[test]
    fn test_scale_applies_fraction_in_base_units() {
        assert_eq!(
            Quantity::from("16Gi").scale(0.5).unwrap(),
            8.0 * 1_073_741_824.0
        );
        assert_eq!(Quantity::from("2").scale(0.65).unwrap(), 1.3);
        assert!(Quantity::from("bogus").scale(0.5).is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Quantity::from("").to_f64().is_err());
        assert!(Quantity::from("12Zi").to_f64().is_err());
        assert!(Quantity::from("twelve").to_f64().is_err());
    }

    #[test]
    fn test_constructors() {
        assert_eq!(Quantity::from_mebibytes(16384).as_str(), "16384Mi");
        assert_eq!(Quantity::from_cores(8).as_str(), "8");
    }
}
