use env_logger::{Builder, Env};
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Install the process-wide logger. Latch and split tracing is `debug`
/// level and noisy, so the default filter is `info`; set `RUST_LOG` to
/// override. Safe to call from every test.
pub fn init_log() {
    INIT.call_once(|| {
        let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
        builder
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} {:<5} [{}] {}",
                    buf.timestamp_millis(),
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .init();
    });
}
