//! Bounded refinement loop.
//!
//! Repeats an attempt, feeding each result back into the next one, until the
//! result is accepted or the iteration budget runs out. Iteration count is
//! explicit; there is no recursion.

#[derive(Debug, Clone, PartialEq)]
pub struct Refined<T> {
    pub value: T,
    /// Attempts made (1-based, never more than the budget).
    pub iterations: u32,
    pub accepted: bool,
}

/// Run `attempt(iteration, previous)` until `accept(&value)` or
/// `max_iterations` attempts have been made. `max_iterations` of 0 is
/// treated as 1.
pub fn refine<T, A, P>(max_iterations: u32, mut attempt: A, mut accept: P) -> Refined<T>
where
    A: FnMut(u32, Option<&T>) -> T,
    P: FnMut(&T) -> bool,
{
    let budget = max_iterations.max(1);
    let mut value = attempt(1, None);
    let mut iterations = 1;

    loop {
        if accept(&value) {
            return Refined {
                value,
                iterations,
                accepted: true,
            };
        }
        if iterations >= budget {
            tracing::debug!(iterations, "Refinement budget exhausted");
            return Refined {
                value,
                iterations,
                accepted: false,
            };
        }
        iterations += 1;
        value = attempt(iterations, Some(&value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_on_first_accepted_value() {
        let mut calls = 0;
        let out = refine(
            5,
            |i, _| {
                calls += 1;
                i * 10
            },
            |v| *v >= 20,
        );
        assert_eq!(out.value, 20);
        assert_eq!(out.iterations, 2);
        assert!(out.accepted);
        assert_eq!(calls, 2);
    }

    #[test]
    fn respects_budget() {
        let out = refine(3, |i, _| i, |_| false);
        assert_eq!(out.value, 3);
        assert_eq!(out.iterations, 3);
        assert!(!out.accepted);
    }

    #[test]
    fn zero_budget_still_runs_once() {
        let out = refine(0, |_, _| "only", |_| false);
        assert_eq!(out.iterations, 1);
        assert_eq!(out.value, "only");
    }

    #[test]
    fn previous_value_is_passed_forward() {
        let mut seen = Vec::new();
        refine(
            3,
            |i, prev: Option<&String>| {
                seen.push(prev.cloned());
                format!("attempt-{i}")
            },
            |_| false,
        );
        assert_eq!(
            seen,
            vec![None, Some("attempt-1".to_string()), Some("attempt-2".to_string())]
        );
    }
}
