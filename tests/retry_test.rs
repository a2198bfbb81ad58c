use std::cell::Cell;
use std::time::{Duration, Instant};
use tierq::error::Error;
use tierq::retry::{RetryPolicy, retry_on_deadlock};

fn busy() -> Error {
    Error::Storage(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
        None,
    ))
}

#[test]
fn transient_failures_are_retried_until_success() {
    let calls = Cell::new(0);
    let value = retry_on_deadlock(&RetryPolicy::immediate(5), || {
        calls.set(calls.get() + 1);
        if calls.get() <= 2 { Err(busy()) } else { Ok("done") }
    })
    .unwrap();

    assert_eq!(value, "done");
    assert_eq!(calls.get(), 3);
}

#[test]
fn persistent_contention_gives_up_after_max_attempts() {
    let calls = Cell::new(0);
    let err = retry_on_deadlock(&RetryPolicy::immediate(4), || -> tierq::error::Result<()> {
        calls.set(calls.get() + 1);
        Err(busy())
    })
    .unwrap_err();

    assert_eq!(calls.get(), 4);
    assert!(err.is_transient());
}

#[test]
fn other_errors_are_not_retried() {
    let calls = Cell::new(0);
    let err = retry_on_deadlock(&RetryPolicy::immediate(5), || -> tierq::error::Result<()> {
        calls.set(calls.get() + 1);
        Err(Error::NotFound("entry".into()))
    })
    .unwrap_err();

    assert_eq!(calls.get(), 1);
    assert!(matches!(err, Error::NotFound(_)));
}

#[test]
fn retries_wait_between_attempts() {
    let policy = RetryPolicy::new(3, Duration::from_millis(30), Duration::from_millis(30));
    let calls = Cell::new(0);
    let start = Instant::now();
    let err = retry_on_deadlock(&policy, || -> tierq::error::Result<()> {
        calls.set(calls.get() + 1);
        Err(busy())
    })
    .unwrap_err();

    assert_eq!(calls.get(), 3);
    assert!(err.is_transient());
    assert!(start.elapsed() >= Duration::from_millis(60));
}
