use hcv_core::config::SloConfig;
use std::time::Duration;

pub const SLO_RESIDUAL_PCT: &str = "max_residual_pct_after_apply";
pub const SLO_DURATION_MS: &str = "max_converge_duration_ms";

#[derive(Debug, Clone, PartialEq)]
pub struct Breach {
    pub slo: &'static str,
    pub value: f64,
    pub threshold: f64,
}

/// Residual as a percentage of planned items; zero when nothing was planned.
pub fn residual_pct(residual: usize, planned: usize) -> f64 {
    if planned == 0 {
        0.0
    } else {
        residual as f64 / planned as f64 * 100.0
    }
}

/// Thresholds exceeded by a finished run. Breaches are reported only; they
/// never change the run's outcome.
pub fn evaluate(slos: &SloConfig, planned: usize, residual: usize, took: Duration) -> Vec<Breach> {
    let mut out = Vec::new();
    let pct = residual_pct(residual, planned);
    if pct > slos.max_residual_pct_after_apply {
        out.push(Breach {
            slo: SLO_RESIDUAL_PCT,
            value: pct,
            threshold: slos.max_residual_pct_after_apply,
        });
    }
    let ms = took.as_millis() as u64;
    if ms > slos.max_converge_duration_ms {
        out.push(Breach {
            slo: SLO_DURATION_MS,
            value: ms as f64,
            threshold: slos.max_converge_duration_ms as f64,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slos(pct: f64, ms: u64) -> SloConfig {
        SloConfig {
            max_residual_pct_after_apply: pct,
            max_converge_duration_ms: ms,
        }
    }

    #[test]
    fn clean_fast_run_has_no_breaches() {
        assert!(evaluate(&slos(0.0, 1000), 4, 0, Duration::from_millis(10)).is_empty());
        assert!(evaluate(&slos(0.0, 1000), 0, 0, Duration::ZERO).is_empty());
    }

    #[test]
    fn residual_and_duration_breaches() {
        let b = evaluate(&slos(10.0, 100), 4, 1, Duration::from_millis(250));
        assert_eq!(b.len(), 2);
        assert_eq!(b[0].slo, SLO_RESIDUAL_PCT);
        assert_eq!(b[0].value, 25.0);
        assert_eq!(b[1].slo, SLO_DURATION_MS);
        assert_eq!(b[1].value, 250.0);
    }

    #[test]
    fn threshold_is_exclusive() {
        assert!(evaluate(&slos(25.0, 100), 4, 1, Duration::from_millis(100)).is_empty());
    }
}
