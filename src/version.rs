use std::{cmp::Ordering, fmt};

/// A mod version as published by a repository or typed in by the user.
///
/// Numeric components are compared as integers; any trailing text after the
/// numbers is kept as a suffix (`1.0b`, `2.1-rc1`). A version with a suffix
/// sorts before the same numbers without one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VersionInfo {
    parts: Vec<u64>,
    suffix: String,
}

impl VersionInfo {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        let mut parts = Vec::new();
        let mut rest = trimmed;
        loop {
            let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
            if digits == 0 {
                break;
            }
            let Ok(value) = rest[..digits].parse::<u64>() else {
                break;
            };
            parts.push(value);
            rest = &rest[digits..];
            match rest.strip_prefix('.') {
                Some(next) if next.starts_with(|c: char| c.is_ascii_digit()) => rest = next,
                _ => break,
            }
        }

        if parts.is_empty() {
            return Self::default();
        }

        let suffix = rest.trim_start_matches(['-', '.', '_', ' ']).to_string();
        Self { parts, suffix }
    }

    pub fn from_parts(major: u64, minor: u64, sub: u64) -> Self {
        Self {
            parts: vec![major, minor, sub],
            suffix: String::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.parts.is_empty()
    }

    pub fn clear(&mut self) {
        self.parts.clear();
        self.suffix.clear();
    }

    pub fn canonical_string(&self) -> String {
        if !self.is_valid() {
            return String::new();
        }
        let numbers = self
            .parts
            .iter()
            .map(|part| part.to_string())
            .collect::<Vec<_>>()
            .join(".");
        if self.suffix.is_empty() {
            numbers
        } else {
            format!("{numbers}{}", self.suffix)
        }
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

impl From<&str> for VersionInfo {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl PartialOrd for VersionInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for idx in 0..len {
            let left = self.parts.get(idx).copied().unwrap_or(0);
            let right = other.parts.get(idx).copied().unwrap_or(0);
            match left.cmp(&right) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        match (self.suffix.is_empty(), other.suffix.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self
                .suffix
                .to_ascii_lowercase()
                .cmp(&other.suffix.to_ascii_lowercase()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_shapes() {
        assert_eq!(VersionInfo::parse("1.2.3").canonical_string(), "1.2.3");
        assert_eq!(VersionInfo::parse("v2.0b").canonical_string(), "2.0b");
        assert_eq!(VersionInfo::parse("1.0-rc1").canonical_string(), "1.0rc1");
        assert!(!VersionInfo::parse("").is_valid());
        assert!(!VersionInfo::parse("latest").is_valid());
    }

    #[test]
    fn orders_numerically_with_padding() {
        assert!(VersionInfo::parse("1.10") > VersionInfo::parse("1.9"));
        assert_eq!(
            VersionInfo::parse("1.0").cmp(&VersionInfo::parse("1.0.0")),
            Ordering::Equal
        );
        assert!(VersionInfo::parse("1.0") > VersionInfo::parse("1.0beta"));
        assert!(VersionInfo::from_parts(1_700_000_000, 0, 0) > VersionInfo::parse("3.2"));
    }
}
