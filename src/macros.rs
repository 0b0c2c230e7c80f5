//! Internal code generation: the newtype pattern used for every
//! kernel-defined enumeration, and the `EINTR` retry wrapper every syscall
//! goes through.

/// Declares a transparent newtype over a kernel enumeration.
///
/// Kernel headers keep growing these enumerations, and drivers report values
/// newer than the ones compiled in, so a native Rust `enum` cannot represent
/// them. The newtype keeps every bit pattern valid while giving the known
/// values named constants and readable `Debug` output.
macro_rules! ffi_enum {
    (
        $( #[$attrs:meta] )*
        pub enum $name:ident: $native:ty {
            $(
                $( #[$variant_attrs:meta] )*
                $variant:ident = $value:expr
            ),+
            $(,)?
        }
    ) => {
        $( #[$attrs] )*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        pub struct $name(pub(crate) $native);

        impl $name {
            $(
                $( #[$variant_attrs] )*
                pub const $variant: Self = Self($value);
            )+
        }

        // Aliased constants (several names sharing one value) make later
        // arms unreachable; the first name wins in Debug output.
        #[allow(unreachable_patterns)]
        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match *self {
                    $(
                        Self::$variant => f.write_str(stringify!($variant)),
                    )+
                    other => write!(f, "{:#x} (unrecognized)", other.0),
                }
            }
        }
    };
}

/// Retries a `nix` call while it fails with `EINTR`.
///
/// Interrupted syscalls must be restarted manually; this applies to every
/// ioctl as well as the `read`/`write`/`poll` calls on the interrupt fd.
macro_rules! retry_eintr {
    ($e:expr) => {{
        loop {
            let res = $e;
            match res {
                Err(nix::errno::Errno::EINTR) => continue,
                other => break other,
            }
        }
    }};
}
