//! A small library to parse command-line and environmental flags.
//!
//! Flags are declared with [`define_flag!`](crate::define_flag) next to the code that reads
//! them. Every flag lives in a static atomic, registers itself at load time and
//! belongs to a marker type so independent subsystems can be parsed separately.

use std::{
    any::TypeId,
    marker::PhantomData,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Clone, Copy)]
enum FlagValue {
    Bool(&'static AtomicBool),
    Usize(&'static AtomicUsize),
}

struct Flag {
    name: &'static str,
    comment: &'static str,
    value: FlagValue,
    is_set: bool,
}

/// All flags of one marker type.
struct Node {
    type_id: TypeId,
    flags: Vec<Flag>,
    initialized: bool,
}

static FLAGS: Mutex<Vec<Node>> = Mutex::new(Vec::new());

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlagError {
    #[error("unknown flag `{0}`")]
    FlagNotFound(String),
    #[error("flags for `{0}` were already parsed")]
    FlagsAlreadyInitialized(&'static str),
    #[error("no flags registered for `{0}`")]
    NoFlags(&'static str),
}

pub struct FlagsOf<T>(PhantomData<T>);

impl<T: 'static> FlagsOf<T> {
    fn with_node<R>(f: impl FnOnce(&mut Node) -> R) -> R {
        let mut nodes = FLAGS.lock();
        let key = TypeId::of::<T>();
        let ix = match nodes.iter().position(|node| node.type_id == key) {
            Some(ix) => ix,
            None => {
                nodes.push(Node {
                    type_id: key,
                    flags: Vec::new(),
                    initialized: false,
                });
                nodes.len() - 1
            }
        };
        f(&mut nodes[ix])
    }

    fn registered() -> bool {
        let key = TypeId::of::<T>();
        FLAGS.lock().iter().any(|node| node.type_id == key)
    }

    fn add_flag(flag: Flag) {
        Self::with_node(|node| {
            if !node.flags.iter().any(|f| f.name == flag.name) {
                node.flags.push(flag);
            }
        })
    }

    pub fn is_set(name: &str) -> bool {
        Self::with_node(|node| {
            node.flags
                .iter()
                .any(|flag| flag.name == name && flag.is_set)
        })
    }

    /// Name and description of every registered flag, sorted by name.
    pub fn describe() -> Vec<(&'static str, &'static str)> {
        let mut out = Self::with_node(|node| {
            node.flags
                .iter()
                .map(|flag| (flag.name, flag.comment))
                .collect::<Vec<_>>()
        });
        out.sort_by(|a, b| a.0.cmp(b.0));
        out
    }

    fn set_flag_from_string(flag: &mut Flag, argument: &str) -> bool {
        match flag.value {
            FlagValue::Bool(slot) => match argument {
                "true" | "1" => slot.store(true, Ordering::Relaxed),
                "false" | "0" => slot.store(false, Ordering::Relaxed),
                _ => return false,
            },

            FlagValue::Usize(slot) => {
                let (digits, radix) = if let Some(hex) = argument.strip_prefix("0x") {
                    (hex, 16)
                } else {
                    (argument, 10)
                };

                match usize::from_str_radix(&digits.replace('_', ""), radix) {
                    Ok(value) => slot.store(value, Ordering::Relaxed),
                    Err(_) => return false,
                }
            }
        }

        flag.is_set = true;
        true
    }

    fn parse(option: &str) -> Result<(), FlagError> {
        let (name, argument) = match option.split_once('=') {
            Some((name, argument)) => (name.to_owned(), argument.to_owned()),
            None => {
                if let Some(name) = option
                    .strip_prefix("no_")
                    .or_else(|| option.strip_prefix("no-"))
                {
                    (name.to_owned(), "false".to_owned())
                } else {
                    (option.to_owned(), "true".to_owned())
                }
            }
        };
        let name = name.replace('-', "_");

        Self::apply(&name, &argument)
    }

    fn apply(name: &str, argument: &str) -> Result<(), FlagError> {
        Self::with_node(|node| {
            let Some(flag) = node.flags.iter_mut().find(|flag| flag.name == name) else {
                return Err(FlagError::FlagNotFound(name.to_owned()));
            };

            if !Self::set_flag_from_string(flag, argument) {
                log::warn!(
                    target: "vmkit::flags",
                    "Ignoring flag: {} is an invalid value for flag {}",
                    argument,
                    name
                );
            }
            Ok(())
        })
    }

    fn process_command_line_flags(
        prefix: Option<&str>,
        flags: impl Iterator<Item = String>,
    ) -> Result<(), FlagError> {
        let cli_prefix = prefix
            .map(|prefix| format!("--{}:", prefix))
            .unwrap_or_else(|| "--".to_owned());

        let mut flags = flags.collect::<Vec<_>>();
        flags.sort();

        for flag in flags.iter() {
            if let Some(option) = flag.strip_prefix(cli_prefix.as_str()) {
                if !option.is_empty() {
                    Self::parse(option)?;
                }
            }
        }

        Self::with_node(|node| node.initialized = true);
        Ok(())
    }

    fn process_environmental_vars(
        prefix: Option<&str>,
        vars: impl Iterator<Item = (String, String)>,
    ) {
        let env_prefix = prefix
            .map(|prefix| format!("VMKIT_{}_", prefix.to_uppercase()))
            .unwrap_or_else(|| "VMKIT_".to_owned());

        for (option, argument) in vars {
            if let Some(name) = option.strip_prefix(env_prefix.as_str()) {
                // unknown variables may belong to another subsystem
                let _ = Self::apply(&name.to_lowercase(), &argument);
            }
        }
    }

    fn check_uninitialized() -> Result<(), FlagError> {
        if !Self::registered() {
            return Err(FlagError::NoFlags(std::any::type_name::<T>()));
        }

        if Self::with_node(|node| node.initialized) {
            return Err(FlagError::FlagsAlreadyInitialized(
                std::any::type_name::<T>(),
            ));
        }

        Ok(())
    }
}

/// Parse flags of `T` from environment variables (`VMKIT_<NAME>`) and then from
/// command-line arguments (`--<name>=<value>`). Arguments win over the environment.
pub fn parse<T: 'static>(
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    FlagsOf::<T>::check_uninitialized()?;
    FlagsOf::<T>::process_environmental_vars(None, env);
    FlagsOf::<T>::process_command_line_flags(None, args)
}

/// Same as [`parse`] but flags are spelled `--<prefix>:<name>=<value>` and
/// `VMKIT_<PREFIX>_<NAME>`.
pub fn parse_with_prefix<T: 'static>(
    prefix: &str,
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    FlagsOf::<T>::check_uninitialized()?;
    FlagsOf::<T>::process_environmental_vars(Some(prefix), env);
    FlagsOf::<T>::process_command_line_flags(Some(prefix), args)
}

#[doc(hidden)]
pub fn register_bool<T: 'static>(
    slot: &'static AtomicBool,
    name: &'static str,
    comment: &'static str,
) {
    FlagsOf::<T>::add_flag(Flag {
        name,
        comment,
        value: FlagValue::Bool(slot),
        is_set: false,
    });
}

#[doc(hidden)]
pub fn register_usize<T: 'static>(
    slot: &'static AtomicUsize,
    name: &'static str,
    comment: &'static str,
) {
    FlagsOf::<T>::add_flag(Flag {
        name,
        comment,
        value: FlagValue::Usize(slot),
        is_set: false,
    });
}

#[doc(hidden)]
pub use ctor::ctor;
#[doc(hidden)]
pub use paste;

/// Declare a flag owned by marker type `$of`.
///
/// Generates `<of>_<name>()`, `set_<of>_<name>()` and `is_<of>_<name>_set()`.
#[macro_export]
macro_rules! define_flag {
    ($of: ident => bool, $name: ident, $default_value: expr, $comment: literal) => {
        $crate::utils::flags::paste::paste! {
            static [<$of:upper _FLAG_ $name:upper>]: std::sync::atomic::AtomicBool =
                std::sync::atomic::AtomicBool::new($default_value);

            #[doc(hidden)]
            #[$crate::utils::flags::ctor]
            fn [<init_ $of:lower _ $name _flag>]() {
                $crate::utils::flags::register_bool::<$of>(
                    &[<$of:upper _FLAG_ $name:upper>],
                    stringify!($name),
                    $comment,
                );
            }

            #[doc = $comment]
            pub fn [<$of:lower _ $name>]() -> bool {
                [<$of:upper _FLAG_ $name:upper>].load(std::sync::atomic::Ordering::Relaxed)
            }

            pub fn [<set_ $of:lower _ $name>]($name: bool) {
                [<$of:upper _FLAG_ $name:upper>].store($name, std::sync::atomic::Ordering::Relaxed)
            }

            pub fn [<is_ $of:lower _ $name _set>]() -> bool {
                $crate::utils::flags::FlagsOf::<$of>::is_set(stringify!($name))
            }
        }
    };

    ($of: ident => usize, $name: ident, $default_value: expr, $comment: literal) => {
        $crate::utils::flags::paste::paste! {
            static [<$of:upper _FLAG_ $name:upper>]: std::sync::atomic::AtomicUsize =
                std::sync::atomic::AtomicUsize::new($default_value);

            #[doc(hidden)]
            #[$crate::utils::flags::ctor]
            fn [<init_ $of:lower _ $name _flag>]() {
                $crate::utils::flags::register_usize::<$of>(
                    &[<$of:upper _FLAG_ $name:upper>],
                    stringify!($name),
                    $comment,
                );
            }

            #[doc = $comment]
            pub fn [<$of:lower _ $name>]() -> usize {
                [<$of:upper _FLAG_ $name:upper>].load(std::sync::atomic::Ordering::Relaxed)
            }

            pub fn [<set_ $of:lower _ $name>]($name: usize) {
                [<$of:upper _FLAG_ $name:upper>].store($name, std::sync::atomic::Ordering::Relaxed)
            }

            pub fn [<is_ $of:lower _ $name _set>]() -> bool {
                $crate::utils::flags::FlagsOf::<$of>::is_set(stringify!($name))
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    pub struct TestFlags;

    crate::define_flag!(TestFlags => usize, spins, 16, "Spin count used by tests");
    crate::define_flag!(TestFlags => bool, verbose, false, "Verbose output used by tests");

    pub struct EmptyFlags;

    #[test]
    fn parse_env_and_args() {
        let env = vec![("VMKIT_TEST_SPINS".to_owned(), "0x20".to_owned())];
        let args = vec!["--test:verbose".to_owned(), "--other:thing=1".to_owned()];

        parse_with_prefix::<TestFlags>("test", args.into_iter(), env.into_iter()).unwrap();

        assert_eq!(testflags_spins(), 32);
        assert!(testflags_verbose());
        assert!(is_testflags_spins_set());

        let again = parse_with_prefix::<TestFlags>(
            "test",
            std::iter::empty(),
            std::iter::empty(),
        );
        assert!(matches!(again, Err(FlagError::FlagsAlreadyInitialized(_))));

        let names = FlagsOf::<TestFlags>::describe()
            .into_iter()
            .map(|(name, _)| name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["spins", "verbose"]);
    }

    #[test]
    fn unknown_marker_has_no_flags() {
        assert!(matches!(
            parse::<EmptyFlags>(std::iter::empty(), std::iter::empty()),
            Err(FlagError::NoFlags(_))
        ));
    }
}
