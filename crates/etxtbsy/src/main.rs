use etxtbsy::{config::Config, log::run_with_logger, worker::FATAL_EXIT_CODE};
use slog::error;
use std::process;

fn main() {
    let config = Config::default();
    run_with_logger(config.log_level, |log| {
        if let Err(err) = etxtbsy::main(config, log.clone()) {
            error!(log, "{err:#}");
            process::exit(FATAL_EXIT_CODE.as_u8().into());
        }
    })
}
