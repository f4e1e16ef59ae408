//! Pattern files.
//!
//! One `theta rho` pair per line, whitespace separated. Blank lines and
//! lines starting with `#` are ignored; malformed lines are skipped with a
//! warning. The parsed sequence is normalised so the first theta is zero.

use std::path::{Path, PathBuf};
use table_core::{TableError, TableResult};
use tracing::{debug, warn};

/// A `(theta, rho)` pair: radians, normalised radius.
pub type Coordinate = (f64, f64);

/// Parse pattern text. Never fails; bad lines are skipped.
pub fn parse_coordinates(text: &str) -> Vec<Coordinate> {
    let mut points = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_line(line) {
            Some(point) => points.push(point),
            None => warn!(line = index + 1, content = %line, "Skipping malformed pattern line"),
        }
    }
    normalize(&mut points);
    points
}

fn parse_line(line: &str) -> Option<Coordinate> {
    let mut fields = line.split_whitespace();
    let theta = fields.next()?.parse::<f64>().ok()?;
    let rho = fields.next()?.parse::<f64>().ok()?;
    if fields.next().is_some() || !theta.is_finite() || !rho.is_finite() {
        return None;
    }
    Some((theta, rho))
}

/// Shift every theta so the first one is exactly zero.
fn normalize(points: &mut [Coordinate]) {
    let Some(&(first, _)) = points.first() else {
        return;
    };
    if first == 0.0 {
        return;
    }
    for point in points.iter_mut() {
        point.0 -= first;
    }
}

/// Read and parse a pattern file.
pub async fn load_pattern(path: &Path) -> TableResult<Vec<Coordinate>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| TableError::Pattern(format!("{}: {}", path.display(), e)))?;
    let points = parse_coordinates(&text);
    debug!(path = %path.display(), points = points.len(), "Pattern loaded");
    Ok(points)
}

/// Resolve a pattern name: an existing path is used as given, anything else
/// is looked up in the pattern directory.
pub fn resolve_pattern_path(dir: &Path, name: impl AsRef<Path>) -> PathBuf {
    let name = name.as_ref();
    if name.is_absolute() || name.exists() {
        name.to_path_buf()
    } else {
        dir.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn two_point_scenario() {
        let points = parse_coordinates("0 0.5\n1.5707963 0.8\n");
        assert_eq!(points, vec![(0.0, 0.5), (1.5707963, 0.8)]);
    }

    #[test]
    fn comments_and_blank_lines_only() {
        assert!(parse_coordinates("# header\n\n   \n# another\n").is_empty());
        assert!(parse_coordinates("").is_empty());
    }

    #[test]
    #[traced_test]
    fn malformed_lines_are_skipped() {
        let text = "0 0\nnot a number\n1.0\n2.0 0.5 9\n3.0 1.0\n";
        assert_eq!(parse_coordinates(text), vec![(0.0, 0.0), (3.0, 1.0)]);
        assert!(logs_contain("Skipping malformed pattern line"));
    }

    #[test]
    fn first_theta_is_normalised_to_zero() {
        let points = parse_coordinates("  2.5 0.1\n3.5\t0.2\r\n");
        assert_eq!(points[0].0, 0.0);
        assert!((points[1].0 - 1.0).abs() < 1e-12);
        assert_eq!(points[1].1, 0.2);
    }

    #[test]
    fn parsing_is_idempotent() {
        let text = "10 0\n# mid comment\n11 0.5\n12 1\n";
        assert_eq!(parse_coordinates(text), parse_coordinates(text));
    }

    #[tokio::test]
    async fn load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spiral.thr");
        std::fs::write(&path, "# spiral\n1 0\n2 0.5\n").unwrap();

        let points = load_pattern(&path).await.unwrap();
        assert_eq!(points, vec![(0.0, 0.0), (1.0, 0.5)]);

        let missing = load_pattern(&dir.path().join("missing.thr")).await;
        assert!(matches!(missing, Err(TableError::Pattern(_))));
    }

    #[test]
    fn relative_names_resolve_into_pattern_dir() {
        let dir = Path::new("/srv/patterns");
        assert_eq!(
            resolve_pattern_path(dir, "custom/star.thr"),
            PathBuf::from("/srv/patterns/custom/star.thr")
        );
        assert_eq!(
            resolve_pattern_path(dir, "/tmp/x.thr"),
            PathBuf::from("/tmp/x.thr")
        );
    }
}
