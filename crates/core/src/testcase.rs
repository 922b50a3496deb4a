//! Named testcases with begin/end events

use crate::event;
use std::fmt::Display;
use std::time::Instant;

/// Emits a failing `tc/end` if the testcase unwinds
struct EndGuard<'a> {
    name: &'a str,
    start: Instant,
    armed: bool,
}

impl Drop for EndGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            event::testcase_end(self.name, self.start.elapsed(), false, Some("panicked"));
        }
    }
}

/// Run `f` as the testcase `name`.
///
/// Emits `tc/begin`, then `tc/end` carrying the duration and whether `f`
/// succeeded. Errors are passed through unchanged.
pub fn testcase<T, E, F>(name: &str, f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
    E: Display,
{
    event::testcase_begin(name);
    let mut guard = EndGuard {
        name,
        start: Instant::now(),
        armed: true,
    };
    let result = f();
    guard.armed = false;

    let duration = guard.start.elapsed();
    match &result {
        Ok(_) => event::testcase_end(name, duration, true, None),
        Err(e) => {
            let message = e.to_string();
            event::exception(name, &message);
            event::testcase_end(name, duration, false, Some(&message));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, capture};

    #[test]
    fn test_success_and_failure() {
        let (result, events) = capture(|| {
            let ok: Result<u32, String> = testcase("passes", || Ok(7));
            assert_eq!(ok, Ok(7));
            testcase("fails", || -> Result<(), String> { Err("no login prompt".into()) })
        });
        assert!(result.is_err());

        let kinds: Vec<_> = events.iter().map(Event::path).collect();
        assert_eq!(
            kinds,
            ["tc/begin", "tc/end", "tc/begin", "exception", "tc/end"]
        );
        assert_eq!(events[1].data["success"], true);
        assert_eq!(events[4].data["success"], false);
        assert_eq!(events[4].data["error"], "no login prompt");
    }

    #[test]
    fn test_nested_testcases_close_in_order() -> anyhow::Result<()> {
        let (result, events) = capture(|| {
            testcase("outer", || -> anyhow::Result<()> {
                testcase("inner", || -> anyhow::Result<()> { Ok(()) })?;
                Ok(())
            })
        });
        result?;
        let names: Vec<_> = events
            .iter()
            .map(|e| format!("{} {}", e.path(), e.data["name"].as_str().unwrap_or("")))
            .collect();
        assert_eq!(
            names,
            [
                "tc/begin outer",
                "tc/begin inner",
                "tc/end inner",
                "tc/end outer"
            ]
        );
        Ok(())
    }
}
