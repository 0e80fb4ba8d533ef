use redox_log::{OutputBuilder, RedoxLogger};

pub fn output_level() -> log::LevelFilter {
    log::LevelFilter::Info
}

pub fn file_level() -> log::LevelFilter {
    log::LevelFilter::Info
}

/// Configures logging for one host controller daemon. On Redox the log is also written into the
/// logging scheme under `category/subcategory/logfile_base.log`.
#[cfg_attr(not(target_os = "redox"), allow(unused_variables, unused_mut))]
pub fn setup_logging(
    category: &str,
    subcategory: &str,
    logfile_base: &str,
    output_level: log::LevelFilter,
    file_level: log::LevelFilter,
) {
    let mut logger = RedoxLogger::new().with_output(
        OutputBuilder::stderr()
            .with_filter(output_level)
            .with_ansi_escape_codes()
            .flush_on_newline(true)
            .build(),
    );

    #[cfg(target_os = "redox")]
    match OutputBuilder::in_redox_logging_scheme(
        category,
        subcategory,
        format!("{logfile_base}.log"),
    ) {
        Ok(b) => {
            logger = logger.with_output(b.with_filter(file_level).flush_on_newline(true).build())
        }
        Err(error) => eprintln!("{logfile_base}: failed to open log file: {}", error),
    }

    if let Err(error) = logger.enable() {
        eprintln!("{logfile_base}: logger already installed: {}", error);
    }
}
