use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ForecastError, Result};
use crate::types::ModelId;

/// One forecast step with its interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub target_timestamp: DateTime<Utc>,
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
}

/// A member's forecast for the ensemble's request, with its normalized weight
#[derive(Debug, Clone)]
pub struct MemberForecast {
    pub model_id: ModelId,
    pub weight: f64,
    pub points: Vec<ForecastPoint>,
}

/// Weighted mean of value and of both bounds at every step. Member
/// intervals are averaged, never narrowed. All members must forecast the
/// same target timestamps in the same order.
pub fn weighted_combine(members: &[MemberForecast]) -> Result<Vec<ForecastPoint>> {
    let first = members
        .first()
        .ok_or_else(|| ForecastError::InvalidInput("no member forecasts to combine".to_string()))?;

    for member in &members[1..] {
        if member.points.len() != first.points.len() {
            return Err(ForecastError::AlignmentError(format!(
                "model {} produced {} steps, model {} produced {}",
                first.model_id,
                first.points.len(),
                member.model_id,
                member.points.len()
            )));
        }
        for (a, b) in first.points.iter().zip(&member.points) {
            if a.target_timestamp != b.target_timestamp {
                return Err(ForecastError::AlignmentError(format!(
                    "model {} targets {} where model {} targets {}",
                    first.model_id, a.target_timestamp, member.model_id, b.target_timestamp
                )));
            }
        }
    }

    let total_weight: f64 = members.iter().map(|m| m.weight).sum();
    if total_weight <= 0.0 {
        return Err(ForecastError::InvalidInput("member weights sum to zero".to_string()));
    }

    let combined = (0..first.points.len())
        .map(|step| {
            let mut value = 0.0;
            let mut lower = 0.0;
            let mut upper = 0.0;
            for member in members {
                let p = &member.points[step];
                value += member.weight * p.value;
                lower += member.weight * p.lower;
                upper += member.weight * p.upper;
            }
            ForecastPoint {
                target_timestamp: first.points[step].target_timestamp,
                value: value / total_weight,
                lower: lower / total_weight,
                upper: upper / total_weight,
            }
        })
        .collect::<Vec<_>>();

    debug!("Combined {} member forecasts over {} steps", members.len(), combined.len());
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ts(day: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::days(day)
    }

    fn member(model_id: ModelId, weight: f64, values: &[(i64, f64, f64, f64)]) -> MemberForecast {
        MemberForecast {
            model_id,
            weight,
            points: values
                .iter()
                .map(|&(day, value, lower, upper)| ForecastPoint {
                    target_timestamp: ts(day),
                    value,
                    lower,
                    upper,
                })
                .collect(),
        }
    }

    #[test]
    fn test_uniform_mean_of_two_members() {
        let combined = weighted_combine(&[
            member(1, 0.5, &[(1, 10.0, 8.0, 12.0)]),
            member(2, 0.5, &[(1, 20.0, 15.0, 26.0)]),
        ])
        .unwrap();

        assert_eq!(combined.len(), 1);
        assert_eq!(combined[0].value, 15.0);
        assert_eq!(combined[0].lower, 11.5);
        assert_eq!(combined[0].upper, 19.0);
        assert_eq!(combined[0].target_timestamp, ts(1));
    }

    #[test]
    fn test_weighted_mean_keeps_interval_width() {
        let combined = weighted_combine(&[
            member(1, 0.75, &[(1, 100.0, 90.0, 110.0), (2, 100.0, 88.0, 112.0)]),
            member(2, 0.25, &[(1, 104.0, 94.0, 114.0), (2, 104.0, 92.0, 116.0)]),
        ])
        .unwrap();

        assert_eq!(combined[0].value, 101.0);
        assert_eq!(combined[0].upper - combined[0].lower, 20.0);
        assert_eq!(combined[1].upper - combined[1].lower, 24.0);
    }

    #[test]
    fn test_misaligned_targets_are_rejected() {
        let err = weighted_combine(&[
            member(1, 0.5, &[(1, 10.0, 9.0, 11.0)]),
            member(2, 0.5, &[(2, 10.0, 9.0, 11.0)]),
        ])
        .unwrap_err();
        assert!(matches!(err, ForecastError::AlignmentError(_)));

        let err = weighted_combine(&[
            member(1, 0.5, &[(1, 10.0, 9.0, 11.0)]),
            member(2, 0.5, &[(1, 10.0, 9.0, 11.0), (2, 10.0, 9.0, 11.0)]),
        ])
        .unwrap_err();
        assert!(matches!(err, ForecastError::AlignmentError(_)));
    }
}
