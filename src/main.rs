use memslice::log::*;
use memslice::*;

use std::path::PathBuf;

use clap::Parser;

/// Compute symbolic address and stride formulas for memory operands
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Analyze a routine given as a textual CFG description
    Analyze {
        /// Path to the CFG description of the routine
        cfg_file: PathBuf,
        /// Path to output file for the computed formulas (stdout if not given)
        #[clap(long)]
        output: Option<PathBuf>,
        /// Output the lifted control flow graph as a GraphViz `.dot` file to the given path
        #[clap(long)]
        debug_output_graphviz: Option<PathBuf>,
        /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
        /// use.
        #[clap(long)]
        debug_disable_terminal_logging: bool,
        /// Force blocking for terminal logging. If too many messages are being spewed the logger,
        /// by default, does not block, but instead dumps a dropped-messages alert. This option
        /// forces it to block and dump even if too many are being sent.
        #[clap(long)]
        debug_forced_blocking_terminal_logging: bool,
        /// Path to send log (as JSON) to
        ///
        /// Error or higher severity alerts will still continue being shown at stderr (in addition
        /// to being added to the log)
        #[clap(long = "--log")]
        log_file: Option<PathBuf>,
        /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
        #[clap(short, long, parse(from_occurrences))]
        debug: usize,
        /// Advanced configuration options to tweak slicing behavior
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<slice_config::CommandLineSliceConfig>,
    },
}

fn main() {
    let args = Args::parse();

    match args {
        Args::Analyze {
            cfg_file,
            output,
            debug_output_graphviz,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
            advanced_config,
        } => {
            let log_guard = slog_scope::set_global_logger(log::FileAndTermDrain::new(
                debug,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            ));

            slice_config::SliceConfig::initialize(advanced_config);

            let cfg = match cfg_lifter::lift_from(
                &std::fs::read_to_string(cfg_file).expect("CFG file could not be read"),
            ) {
                Ok(cfg) => cfg,
                Err(e) => {
                    crit!("Could not lift CFG"; "error" => %e);
                    drop(log_guard);
                    std::process::exit(1);
                }
            };

            if let Some(path) = debug_output_graphviz {
                use std::io::Write;
                write!(
                    std::fs::File::create(path).unwrap(),
                    "{}",
                    cfg.generate_dot()
                )
                .unwrap();
            }

            let formulas = match analysis::analyze_routine(&cfg) {
                Ok(formulas) => formulas,
                Err(e) => {
                    crit!("Analysis failed"; "routine" => &cfg.name, "error" => %e);
                    drop(log_guard);
                    std::process::exit(2);
                }
            };

            if let Some(path) = output {
                use std::io::Write;
                write!(std::fs::File::create(path).unwrap(), "{}", formulas).unwrap();
            } else {
                print!("{}", formulas);
            }

            trace!("Done");
            drop(log_guard);
        }
    }
}
