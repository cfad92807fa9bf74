//! Retry-cycle parsing and due-date arithmetic.
//!
//! A failed-job retry policy is configured per activity as
//! `R{n}/{ISO-8601 duration}` (e.g. `R3/PT10M`): a bounded cyclic schedule of
//! `n` repetitions spaced by the duration. Attempt `k` (1-based) sets the due
//! date to `failure time + duration` and retries-remaining to `n - k`.
//! Expressions may also be `${variable}` indirections resolved against the
//! failing execution's visible variables at failure time; anything that does
//! not resolve falls back to the engine-wide default policy rather than
//! failing the retry computation itself.

use crate::types::VariableMap;
use thiserror::Error;

/// Parsed `R{n}/{duration}` cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryCycle {
    pub repetitions: u32,
    pub interval: chrono::Duration,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CycleParseError {
    #[error("malformed retry cycle '{0}', expected R{{n}}/{{ISO-8601 duration}}")]
    Malformed(String),

    #[error("malformed ISO-8601 duration '{0}'")]
    BadDuration(String),
}

impl std::str::FromStr for RetryCycle {
    type Err = CycleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix('R') {
            let (count, duration) = rest
                .split_once('/')
                .ok_or_else(|| CycleParseError::Malformed(s.to_string()))?;
            let repetitions: u32 = count
                .parse()
                .map_err(|_| CycleParseError::Malformed(s.to_string()))?;
            if repetitions == 0 {
                return Err(CycleParseError::Malformed(s.to_string()));
            }
            Ok(RetryCycle {
                repetitions,
                interval: parse_duration(duration)?,
            })
        } else {
            // Bare duration: a single repetition.
            Ok(RetryCycle {
                repetitions: 1,
                interval: parse_duration(s)?,
            })
        }
    }
}

/// Parse an ISO-8601 duration of the form `PnDTnHnMnS` (integer components;
/// `nW` weeks accepted as a date-part shorthand).
pub fn parse_duration(s: &str) -> Result<chrono::Duration, CycleParseError> {
    let bad = || CycleParseError::BadDuration(s.to_string());
    let body = s.strip_prefix('P').ok_or_else(bad)?;
    if body.is_empty() {
        return Err(bad());
    }

    let (date_part, time_part) = match body.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (body, None),
    };
    if matches!(time_part, Some("")) {
        return Err(bad());
    }

    let mut total = chrono::Duration::zero();
    let mut any = false;

    for (part, units) in [
        (Some(date_part), [('W', 604_800i64), ('D', 86_400), ('\0', 0), ('\0', 0)]),
        (time_part, [('H', 3_600i64), ('M', 60), ('S', 1), ('\0', 0)]),
    ] {
        let Some(part) = part else { continue };
        let mut rest = part;
        for (designator, secs) in units {
            if designator == '\0' {
                break;
            }
            if let Some(idx) = rest.find(designator) {
                let value: i64 = rest[..idx].parse().map_err(|_| bad())?;
                if value < 0 {
                    return Err(bad());
                }
                total += chrono::Duration::seconds(value * secs);
                rest = &rest[idx + 1..];
                any = true;
            }
        }
        if !rest.is_empty() {
            return Err(bad());
        }
    }

    if !any {
        return Err(bad());
    }
    Ok(total)
}

/// Resolve a retry-cycle expression against the failing execution's visible
/// variables. Returns `None` when the expression does not resolve to a valid
/// cycle, which callers treat as "use the engine default".
pub fn resolve_cycle(expr: &str, variables: &VariableMap) -> Option<RetryCycle> {
    let literal: String = if let Some(name) = expr
        .trim()
        .strip_prefix("${")
        .and_then(|s| s.strip_suffix('}'))
    {
        match variables.get(name.trim()) {
            Some(serde_json::Value::String(s)) => s.clone(),
            _ => return None,
        }
    } else {
        expr.to_string()
    };
    literal.parse().ok()
}
