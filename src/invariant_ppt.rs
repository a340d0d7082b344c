//! Runtime invariants with contract coverage
//!
//! Pipeline code states its invariants with [`assert_invariant!`]; every
//! checked invariant is recorded per thread, so a contract test can prove that
//! a scenario actually exercised the checks it relies on.
//!
//! ```rust,ignore
//! use focusstack::invariant_ppt::*;
//!
//! assert_invariant!(
//!     sum_is_one,
//!     "Blend weights sum to one",
//!     "DepthMapStack::composite"
//! );
//!
//! #[test]
//! fn contract_blending() {
//!     // ... run a composite ...
//!     contract_test("blending", &["Blend weights sum to one"]);
//! }
//! ```

use std::cell::RefCell;
use std::collections::HashSet;
use std::thread_local;

thread_local! {
    static CHECKED: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

/// Assert an invariant and record that it was checked.
///
/// # Panics
/// Panics if the condition is false.
#[macro_export]
macro_rules! assert_invariant {
    ($condition:expr, $message:expr) => {
        $crate::invariant_ppt::__assert_invariant_impl($condition, $message, None)
    };
    ($condition:expr, $message:expr, $context:expr) => {
        $crate::invariant_ppt::__assert_invariant_impl($condition, $message, Some($context))
    };
}

#[doc(hidden)]
pub fn __assert_invariant_impl(condition: bool, message: &str, context: Option<&str>) {
    CHECKED.with(|log| {
        log.borrow_mut().insert(message.to_string());
    });

    if !condition {
        panic!(
            "INVARIANT VIOLATION [{}]: {}",
            context.unwrap_or("unknown"),
            message
        );
    }
}

/// Panics unless every invariant in `required` was checked on this thread.
pub fn contract_test(name: &str, required: &[&str]) {
    let missing: Vec<&str> = CHECKED.with(|log| {
        let log = log.borrow();
        required
            .iter()
            .copied()
            .filter(|invariant| !log.contains(*invariant))
            .collect()
    });

    if !missing.is_empty() {
        panic!(
            "CONTRACT FAILURE [{}]: invariants never checked:\n  - {}",
            name,
            missing.join("\n  - ")
        );
    }
}

/// Forget every recorded check on this thread
pub fn clear_invariant_log() {
    CHECKED.with(|log| log.borrow_mut().clear());
}
