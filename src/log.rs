//! Logging interface, contingent on the `log` feature
//!
//! Only enable `log` when debugging, and when you're certain that your
//! logger isn't using USB! Without the feature, the arguments are still
//! type checked, but nothing is formatted.

macro_rules! debug {
    ($($args:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::debug!($($args)*);
        #[cfg(not(feature = "log"))]
        let _ = format_args!($($args)*);
    }};
}

macro_rules! warn {
    ($($args:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::warn!($($args)*);
        #[cfg(not(feature = "log"))]
        let _ = format_args!($($args)*);
    }};
}
