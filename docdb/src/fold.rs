//! Case-folding plug-in boundary.
//!
//! The core never implements Unicode case folding itself (see spec
//! Non-goals); callers may inject their own `Fold` for ILEX indexes and
//! `$icase` predicates. The default is locale-independent and idempotent,
//! which is all the engine requires from it.

/// Normalizes a string for case-insensitive comparison.
pub trait Fold: Send + Sync {
    /// Folds `text` into its comparison form. Must be idempotent:
    /// `fold(fold(x)) == fold(x)`.
    fn fold(&self, text: &str) -> String;
}

/// `str::to_lowercase`-based default fold.
#[derive(Debug, Default, Clone, Copy)]
pub struct LowercaseFold;

impl Fold for LowercaseFold {
    fn fold(&self, text: &str) -> String {
        text.to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::{Fold, LowercaseFold};

    #[test]
    fn idempotent() {
        let fold = LowercaseFold;
        let once = fold.fold("HeLLo");
        let twice = fold.fold(&once);
        assert_eq!(once, twice);
    }
}
