use anyhow::{bail, Context, Result};
use std::path::Path;

/// Ensure directory exists
pub fn ensure_dir<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {:?}", path))?;
    }
    Ok(())
}

/// Format duration as human-readable string
pub fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else if secs < 3600.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}h", secs / 3600.0)
    }
}

/// Validate that value is in range
pub fn in_range<T: PartialOrd + std::fmt::Display>(value: T, min: T, max: T, name: &str) -> Result<()> {
    if value < min || value > max {
        bail!("{} must be between {} and {}, got {}", name, min, max, value);
    }
    Ok(())
}

/// Validate that value is positive
pub fn positive<T: PartialOrd + Default + std::fmt::Display>(value: T, name: &str) -> Result<()> {
    if value <= T::default() {
        bail!("{} must be positive, got {}", name, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30.0), "30.0s");
        assert_eq!(format_duration(90.0), "1.5m");
        assert_eq!(format_duration(3600.0), "1.0h");
    }

    #[test]
    fn test_ensure_dir() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
        ensure_dir(&nested).unwrap();
    }

    #[test]
    fn test_validation() {
        assert!(in_range(0.5, 0.0, 1.0, "value").is_ok());
        assert!(in_range(1.5, 0.0, 1.0, "value").is_err());

        assert!(positive(1usize, "value").is_ok());
        assert!(positive(0usize, "value").is_err());
    }
}
