//! Tracing subscriber setup for embedders and tests

use tracing::Subscriber;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global fmt subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence over `default_filter`. Calling this more than
/// once is harmless; only the first call installs a subscriber.
pub fn init_tracing(default_filter: &str) {
    init_tracing_with_writer(default_filter, std::io::stderr);
}

/// Like [`init_tracing`], but formatted events go to `writer`.
///
/// Test harnesses pass `tracing_subscriber::fmt::TestWriter` here so output
/// is captured per test.
pub fn init_tracing_with_writer<W>(default_filter: &str, writer: W)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let _ = subscriber(default_filter, writer).try_init();
}

fn subscriber<W>(default_filter: &str, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(writer);

    tracing_subscriber::registry().with(filter).with(fmt_layer)
}
