//! Property value comparison
//!
//! Values are comma-separated lists of alternatives, as ICC dictionary tags
//! store them (`"sRGB,IEC61966-2.1"`). Two values match when any pair of
//! alternatives matches.

use std::sync::OnceLock;

use regex::Regex;

/// Relative tolerance used for decimal values in fuzzy mode
pub const DEFAULT_FUZZY_DELTA: f64 = 0.0005;

/// First decimal number inside otherwise free text
fn embedded_number() -> Option<&'static Regex> {
    static EMBEDDED_NUMBER: OnceLock<Option<Regex>> = OnceLock::new();
    EMBEDDED_NUMBER
        .get_or_init(|| Regex::new(r"^(.*?)(-?\d+(?:\.\d+)?)(.*)$").ok())
        .as_ref()
}

fn within_delta(a: f64, b: f64, delta: f64) -> bool {
    if a == b {
        return true;
    }
    (a - b).abs() <= delta * a.abs().max(b.abs())
}

fn alternative_match(a: &str, b: &str, fuzzy: Option<f64>) -> bool {
    if a == b {
        return true;
    }
    let delta = match fuzzy {
        Some(delta) => delta,
        None => return false,
    };

    if let (Ok(x), Ok(y)) = (a.parse::<i64>(), b.parse::<i64>()) {
        return x == y;
    }
    if let (Ok(x), Ok(y)) = (a.parse::<f64>(), b.parse::<f64>()) {
        return within_delta(x, y, delta);
    }

    let re = match embedded_number() {
        Some(re) => re,
        None => return false,
    };
    match (re.captures(a), re.captures(b)) {
        (Some(ca), Some(cb)) => {
            if ca[1] != cb[1] || ca[3] != cb[3] {
                return false;
            }
            // serials and model numbers: integers never drift
            if !ca[2].contains('.') && !cb[2].contains('.') {
                return matches!((ca[2].parse::<i64>(), cb[2].parse::<i64>()), (Ok(x), Ok(y)) if x == y);
            }
            match (ca[2].parse::<f64>(), cb[2].parse::<f64>()) {
                (Ok(x), Ok(y)) => within_delta(x, y, delta),
                _ => false,
            }
        }
        _ => false,
    }
}

/// Compare two property values.
///
/// Exact mode (`fuzzy == None`) compares alternatives as strings. Fuzzy mode
/// additionally treats `"2.2"` and `"2.2001"`, or `"gamma 2.2"` and
/// `"gamma 2.2001"`, as equal within the relative `delta`. Integers, bare or
/// embedded, only match when equal.
pub fn values_match(a: &str, b: &str, fuzzy: Option<f64>) -> bool {
    a.split(',')
        .map(str::trim)
        .any(|x| b.split(',').map(str::trim).any(|y| alternative_match(x, y, fuzzy)))
}
