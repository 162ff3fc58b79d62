//! A global store of flags that tune slicing.
//!
//! WARNING: Only a single configuration per process is supported; all threads and all analyzed
//! routines see the same flags.

/// The global configuration store. Its fields are expected to be accessed across the program via
/// the global [`CONFIG`](static@CONFIG).
pub struct SliceConfig {
    /// Treat decoder coverage gaps (unexpected operand counts, unmodeled register classes, ...)
    /// as errors that abort the analysis of the routine. If `false`, they are logged and the
    /// affected value becomes an opaque register term.
    pub strict_invariants: bool,
    /// Resolve loads by matching them against earlier stores to the same symbolic address.
    pub follow_spills: bool,
    /// Dump the pending value stack after each computed definition (at trace level)
    pub debug_print_value_stack: bool,
    /// Log every cyclic path built for stride computation
    pub debug_print_cyclic_paths: bool,
}

impl SliceConfig {
    /// Internal method: sets up initialization
    #[allow(static_mut_refs)]
    fn from_initialized() -> Self {
        let init = unsafe {
            INTERNAL_CONFIG_INITIALIZER
                .take()
                .expect("Should be initialized only once")
        };
        init.unwrap_or_default()
    }

    /// Initialize with the given command line configuration. Should only be called once, and should
    /// only be called from `main`.
    #[allow(static_mut_refs)]
    pub fn initialize(command_line_config: Vec<CommandLineSliceConfig>) {
        let prev = unsafe { INTERNAL_CONFIG_INITIALIZER.replace(Some(command_line_config.into())) };
        assert!(prev.is_some(), "Performed double initialization");
        lazy_static::initialize(&CONFIG);
    }
}

/// Internal initialization detail.
static mut INTERNAL_CONFIG_INITIALIZER: Option<Option<SliceConfig>> = Some(None);

lazy_static::lazy_static! {
    /// The global configuration store
    pub static ref CONFIG: SliceConfig = SliceConfig::from_initialized();
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Slicing configuration parameters
pub enum CommandLineSliceConfig {
    EnableStrictInvariants,
    DisableSpillFollowing,
    EnableDebugPrintValueStack,
    EnableDebugPrintCyclicPaths,
}

impl Default for SliceConfig {
    fn default() -> Self {
        SliceConfig {
            strict_invariants: false,
            follow_spills: true,
            debug_print_value_stack: false,
            debug_print_cyclic_paths: false,
        }
    }
}

impl From<Vec<CommandLineSliceConfig>> for SliceConfig {
    fn from(v: Vec<CommandLineSliceConfig>) -> Self {
        use CommandLineSliceConfig::*;
        let mut r = SliceConfig::default();
        for v in v {
            match v {
                EnableStrictInvariants => {
                    r.strict_invariants = true;
                }
                DisableSpillFollowing => {
                    r.follow_spills = false;
                }
                EnableDebugPrintValueStack => {
                    r.debug_print_value_stack = true;
                }
                EnableDebugPrintCyclicPaths => {
                    r.debug_print_cyclic_paths = true;
                }
            }
        }
        r
    }
}
