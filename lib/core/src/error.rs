//! Error handling foundation for driftwood.
//!
//! Only the `Result` alias lives here. Each crate defines its own domain
//! error enums; a layer wraps the errors of the layer below in one of its
//! own variants before reporting them.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_type_works() {
        let ok: Result<u32> = Ok(7);
        assert_eq!(ok.expect("should be ok"), 7);
    }
}
