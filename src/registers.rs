//! Register cache seam.
//!
//! The engine never retains register values itself. Every successful read
//! pushes the value to a caller-supplied [`RegisterSink`], keyed by the
//! 4-hex-character register address.

/// Receiver for register values produced by read transactions.
///
/// Returning `false` reports that the value contradicts what the caller
/// already holds; the engine counts this as a sync error but the
/// transaction still succeeds.
pub trait RegisterSink: Send + Sync {
    /// Called once per successful read transaction.
    ///
    /// `register` is the 4-hex-character address, `value` the hex-encoded
    /// payload (or its character decode when `is_string` is set), and
    /// `is_file` marks file-record reads.
    fn update(&self, register: &str, value: &str, is_string: bool, is_file: bool) -> bool;
}

/// Adapter wrapping a closure as a [`RegisterSink`].
pub struct SinkFn<F>(F);

/// Wrap a closure as a register sink.
pub fn sink_fn<F>(f: F) -> SinkFn<F>
where
    F: Fn(&str, &str, bool, bool) -> bool + Send + Sync,
{
    SinkFn(f)
}

impl<F> RegisterSink for SinkFn<F>
where
    F: Fn(&str, &str, bool, bool) -> bool + Send + Sync,
{
    fn update(&self, register: &str, value: &str, is_string: bool, is_file: bool) -> bool {
        (self.0)(register, value, is_string, is_file)
    }
}

/// Sink that drops every update, for diagnostic transactions and tests.
#[derive(Debug, Default)]
pub struct NullSink;

impl RegisterSink for NullSink {
    fn update(&self, _register: &str, _value: &str, _is_string: bool, _is_file: bool) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_fn_forwards_arguments() {
        let sink = sink_fn(|register: &str, value: &str, is_string: bool, is_file: bool| {
            register == "0007" && value == "1234" && !is_string && !is_file
        });
        assert!(sink.update("0007", "1234", false, false));
        assert!(!sink.update("0008", "1234", false, false));
    }

    #[test]
    fn test_null_sink_accepts_everything() {
        assert!(NullSink.update("0007", "1234", false, false));
    }
}
