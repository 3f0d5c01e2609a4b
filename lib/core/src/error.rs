//! Error handling foundation shared by the flowgrid crates.
//!
//! Only the `Result` alias lives here. Every crate owns its domain error
//! enums; rootcause reports carry them across layers, and each layer attaches
//! its own context with `.context()` on the way up.

use rootcause::Report;

/// Result whose error side is a rootcause report over context `C`.
///
/// `C` defaults to `()` for call sites that only need a dynamic report.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Unreachable;

    impl std::fmt::Display for Unreachable {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "unreachable")
        }
    }

    impl std::error::Error for Unreachable {}

    #[test]
    fn typed_result_carries_context() {
        let err: Result<(), Unreachable> = Err(Unreachable.into());
        let report = err.expect_err("should be an error");
        assert_eq!(report.current_context().to_string(), "unreachable");
    }
}
