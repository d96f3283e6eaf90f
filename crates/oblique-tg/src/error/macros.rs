/// Shortcut for `map_err` closures that put the error into the `source`
/// field of the given subsystem error variant.
macro_rules! err_ctx {
    ($variant_path:path) => {
        |source| {
            use $variant_path as Variant;
            $crate::error::Error::from(Variant {
                source: ::std::convert::Into::into(source),
            })
        }
    };
}

/// Creates a [`ErrorKind::Fatal`] error with the given formatting string
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::Error::from($crate::error::ErrorKind::Fatal {
            message: format!($($arg)*),
            source: None,
        })
    };
}

pub(crate) use err_ctx;
pub(crate) use fatal;
