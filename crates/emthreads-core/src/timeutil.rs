//! Absolute-deadline arithmetic for the timed waits.

use std::time::{Duration, SystemTime};

/// Time left until an absolute deadline, saturating at zero.
///
/// A zero result still permits one non-blocking acquisition attempt, so a
/// deadline already in the past cannot hide a wakeup that is ready at the
/// time of the call.
pub(crate) fn remaining_until(deadline: SystemTime) -> Duration {
    deadline
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO)
}
