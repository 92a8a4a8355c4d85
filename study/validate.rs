use crate::regress::model::ModelKind;
use std::fmt;

/// Counts recorded for a task, whether or not it was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedCounts {
    Binary {
        cases: usize,
        controls: usize,
        total: usize,
    },
    Continuous {
        observations: usize,
    },
}

/// Why a task was not fitted.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    InsufficientData { rows: usize, required: usize },
    NotBinary { value: f64 },
    NoVariation,
    InsufficientCases { cases: usize, required: usize },
    InsufficientControls { controls: usize, required: usize },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::InsufficientData { rows, required } => {
                write!(f, "Insufficient data: {rows} rows (< {required})")
            }
            RejectReason::NotBinary { value } => {
                write!(f, "Dependent variable is not binary: found value {value}")
            }
            RejectReason::NoVariation => write!(
                f,
                "No variation in dependent variable (all cases or all controls)"
            ),
            RejectReason::InsufficientCases { cases, required } => {
                write!(f, "Insufficient cases: {cases} (< {required})")
            }
            RejectReason::InsufficientControls { controls, required } => {
                write!(f, "Insufficient controls: {controls} (< {required})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admissibility {
    Admissible(ObservedCounts),
    Rejected {
        reason: RejectReason,
        counts: Option<ObservedCounts>,
    },
}

/// Decides whether a task has enough usable data for `model`.
///
/// `response` holds the dependent values of the complete-case rows.
pub fn validate_task(response: &[f64], model: ModelKind, min_case_count: usize) -> Admissibility {
    let total = response.len();
    if total < min_case_count {
        return Admissibility::Rejected {
            reason: RejectReason::InsufficientData {
                rows: total,
                required: min_case_count,
            },
            counts: None,
        };
    }
    if !model.is_binary() {
        return Admissibility::Admissible(ObservedCounts::Continuous {
            observations: total,
        });
    }

    let (cases, controls) = match count_outcomes(response) {
        Ok(counts) => counts,
        Err(value) => {
            return Admissibility::Rejected {
                reason: RejectReason::NotBinary { value },
                counts: None,
            };
        }
    };
    let counts = ObservedCounts::Binary {
        cases,
        controls,
        total,
    };
    let reason = if cases == 0 || controls == 0 {
        RejectReason::NoVariation
    } else if cases < min_case_count {
        RejectReason::InsufficientCases {
            cases,
            required: min_case_count,
        }
    } else if controls < min_case_count {
        RejectReason::InsufficientControls {
            controls,
            required: min_case_count,
        }
    } else {
        return Admissibility::Admissible(counts);
    };
    Admissibility::Rejected {
        reason,
        counts: Some(counts),
    }
}

/// `(cases, controls)`, or the first value that is neither 0 nor 1.
fn count_outcomes(response: &[f64]) -> Result<(usize, usize), f64> {
    let mut cases = 0;
    let mut controls = 0;
    for &value in response {
        if value == 1.0 {
            cases += 1;
        } else if value == 0.0 {
            controls += 1;
        } else {
            return Err(value);
        }
    }
    Ok((cases, controls))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_few_rows_is_rejected_before_counting() {
        let verdict = validate_task(&[0.0, 1.0, 1.0], ModelKind::Firth, 5);
        let Admissibility::Rejected { reason, counts } = verdict else {
            panic!("expected rejection");
        };
        assert!(reason.to_string().to_lowercase().contains("insufficient data"));
        assert_eq!(counts, None);
    }

    #[test]
    fn identical_responses_report_true_counts() {
        let verdict = validate_task(&[1.0, 1.0, 1.0, 1.0], ModelKind::Logistic, 1);
        assert_eq!(
            verdict,
            Admissibility::Rejected {
                reason: RejectReason::NoVariation,
                counts: Some(ObservedCounts::Binary {
                    cases: 4,
                    controls: 0,
                    total: 4
                }),
            }
        );
        assert!(RejectReason::NoVariation
            .to_string()
            .to_lowercase()
            .contains("no variation"));
    }

    #[test]
    fn case_and_control_minimums_are_checked_in_order() {
        let few_cases = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let few_controls = [1.0, 1.0, 1.0, 1.0, 1.0, 0.0];
        assert!(matches!(
            validate_task(&few_cases, ModelKind::FirthHybrid, 2),
            Admissibility::Rejected {
                reason: RejectReason::InsufficientCases { cases: 1, required: 2 },
                ..
            }
        ));
        assert!(matches!(
            validate_task(&few_controls, ModelKind::Firth, 2),
            Admissibility::Rejected {
                reason: RejectReason::InsufficientControls { controls: 1, required: 2 },
                ..
            }
        ));
    }

    #[test]
    fn non_binary_dependent_is_rejected_for_logistic_but_fine_for_linear() {
        let response = [0.0, 1.0, 2.0, 1.0];
        assert_eq!(
            validate_task(&response, ModelKind::Logistic, 1),
            Admissibility::Rejected {
                reason: RejectReason::NotBinary { value: 2.0 },
                counts: None,
            }
        );
        assert_eq!(
            validate_task(&response, ModelKind::Linear, 4),
            Admissibility::Admissible(ObservedCounts::Continuous { observations: 4 })
        );
    }
}
