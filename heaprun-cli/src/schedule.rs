//! Sweep scheduling: the space-filling `fillin` order and the nonlinear
//! `spread` remapping of heap-factor indices.

use std::process::Command;

use anyhow::{Context, Result};

/// Visit the integers `0..=2^levels` round by round, extremes and midpoint
/// first, then progressively finer strata.
///
/// Each round calls `callback(2^levels, points)`. Every integer in the space
/// is emitted in exactly one round, so a long sweep interrupted partway can
/// be resumed: passing `start` equal to a previously-reached round's base
/// suppresses everything before that round and reproduces the remaining
/// schedule exactly.
pub fn fillin<F, E>(mut callback: F, levels: u32, start: Option<u64>) -> Result<(), E>
where
    F: FnMut(u64, &[u64]) -> Result<(), E>,
{
    let end = 1u64 << levels;
    let mut commenced = false;
    if start.is_none() {
        let first: Vec<u64> = (0..=end).step_by(1 << (levels - 1)).collect();
        callback(end, &first)?;
        commenced = true;
    }
    for i in 1..levels {
        let base = 1u64 << (levels - 1 - i);
        let step = 1u64 << (levels - i);
        if start == Some(base) {
            commenced = true;
        }
        if commenced {
            let points: Vec<u64> = (0..)
                .map(|k| base + k * step)
                .take_while(|&p| p < end)
                .collect();
            callback(end, &points)?;
        }
    }
    Ok(())
}

/// Remap `n` of `0..=N` so consecutive points start `spread_factor/(N-1)`
/// closer together at the small end.
///
/// Heap-size sensitivity is highest near the minimum heap, so sweeps want
/// finer steps there. `spread_factor = 0` is the identity.
pub fn spread(spread_factor: u64, n_total: u64, n: u64) -> f64 {
    let triangular = (n * n - n) as f64 / 2.0;
    n as f64 + spread_factor as f64 / (n_total - 1) as f64 * triangular
}

/// Heap factors for the requested indices, normalized so the full sweep
/// spans `[1, heap_range]`.
pub fn get_hfacs(heap_range: u64, spread_factor: u64, n_total: u64, ns: &[u64]) -> Vec<f64> {
    let start = 1.0;
    let end = heap_range as f64;
    let divisor = spread(spread_factor, n_total, n_total) / (end - start);
    ns.iter()
        .map(|&n| spread(spread_factor, n_total, n) / divisor + start)
        .collect()
}

/// Render a heap factor the way log filenames do: `hfac * 1000`, truncated.
pub fn hfac_str(hfac: f64) -> String {
    ((hfac * 1000.0) as i64).to_string()
}

/// The `fillin` subcommand: drive an external program once per round with
/// the denominator and the round's points as arguments.
pub fn run_fillin_command(prog: &str, levels: u32, start: Option<u64>) -> Result<()> {
    if levels == 0 {
        anyhow::bail!("LEVELS must be at least 1");
    }
    fillin(
        |end, ns| {
            let mut command = Command::new(prog);
            command.arg(end.to_string());
            command.args(ns.iter().map(|n| n.to_string()));
            let output = command
                .output()
                .with_context(|| format!("failed to run '{}'", prog))?;
            if !output.status.success() {
                anyhow::bail!("'{}' exited with {}", prog, output.status);
            }
            print!("{}", String::from_utf8_lossy(&output.stdout));
            Ok(())
        },
        levels,
        start,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(levels: u32, start: Option<u64>) -> Vec<(u64, Vec<u64>)> {
        let mut rounds = Vec::new();
        fillin::<_, std::convert::Infallible>(
            |end, ns| {
                rounds.push((end, ns.to_vec()));
                Ok(())
            },
            levels,
            start,
        )
        .unwrap();
        rounds
    }

    #[test]
    fn three_levels() {
        assert_eq!(
            collect(3, None),
            vec![
                (8, vec![0, 4, 8]),
                (8, vec![2, 6]),
                (8, vec![1, 3, 5, 7]),
            ]
        );
    }

    #[test]
    fn four_levels() {
        assert_eq!(
            collect(4, None),
            vec![
                (16, vec![0, 8, 16]),
                (16, vec![4, 12]),
                (16, vec![2, 6, 10, 14]),
                (16, vec![1, 3, 5, 7, 9, 11, 13, 15]),
            ]
        );
    }

    #[test]
    fn start_resumes_mid_schedule() {
        assert_eq!(
            collect(3, Some(2)),
            vec![(8, vec![2, 6]), (8, vec![1, 3, 5, 7])]
        );
        assert_eq!(collect(4, Some(2)), vec![
            (16, vec![2, 6, 10, 14]),
            (16, vec![1, 3, 5, 7, 9, 11, 13, 15]),
        ]);
    }

    #[test]
    fn start_matching_no_base_emits_nothing() {
        assert!(collect(3, Some(5)).is_empty());
    }

    #[test]
    fn every_point_emitted_once() {
        let mut seen: Vec<u64> = collect(5, None).into_iter().flat_map(|(_, ns)| ns).collect();
        seen.sort_unstable();
        let expected: Vec<u64> = (0..=32).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn zero_levels_rejected() {
        assert!(run_fillin_command("/bin/true", 0, None).is_err());
    }

    #[test]
    fn spread_zero_is_identity() {
        for n in 0..=8 {
            assert_eq!(spread(0, 8, n), n as f64);
        }
    }

    #[test]
    fn spread_one_matches_closed_form() {
        // With spread_factor 1 and N = 8, consecutive points drift apart by
        // (n-1)/7: n=3 maps to 3 + 3/7, n=8 maps to 12.
        assert!((spread(1, 8, 0) - 0.0).abs() < 1e-9);
        assert!((spread(1, 8, 1) - 1.0).abs() < 1e-9);
        assert!((spread(1, 8, 3) - (3.0 + 3.0 / 7.0)).abs() < 1e-9);
        assert!((spread(1, 8, 7) - 10.0).abs() < 1e-9);
        assert!((spread(1, 8, 8) - 12.0).abs() < 1e-9);
    }

    #[test]
    fn hfacs_span_one_to_heap_range() {
        let hfacs = get_hfacs(6, 1, 8, &[0, 4, 8]);
        assert!((hfacs[0] - 1.0).abs() < 1e-9);
        assert!((hfacs[2] - 6.0).abs() < 1e-9);
        assert!(hfacs[1] > 1.0 && hfacs[1] < 6.0);
        // The spread pushes the midpoint below the linear halfway mark.
        assert!(hfacs[1] < 3.5);
    }

    #[test]
    fn hfac_str_truncates() {
        assert_eq!(hfac_str(1.0), "1000");
        assert_eq!(hfac_str(2.3333), "2333");
    }
}
