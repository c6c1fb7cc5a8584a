use clap::{Parser, ValueEnum};
use mock_ukey::{CertificateReply, DEFAULT_PASSWORD, MockConfig, MockUkey};

#[derive(Debug, Clone, ValueEnum)]
enum Bootstrap {
    Certificate,
    Refused,
    Malformed,
    Silent,
    Hangup,
}

#[derive(Parser)]
struct Args {
    #[clap(long, default_value = "127.0.0.1:61232")]
    listen: String,
    #[clap(long, env = "MOCK_UKEY_BOOTSTRAP", default_value = "certificate")]
    bootstrap: Bootstrap,
    /// Body returned for the signing certificate
    #[clap(long, env = "MOCK_UKEY_CERTIFICATE", default_value = "BBBB")]
    certificate: String,
    #[clap(long, env = "MOCK_UKEY_PASSWORD", default_value = DEFAULT_PASSWORD)]
    password: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mock_ukey=debug")),
        )
        .init();

    let args = Args::parse();
    let certificate = match args.bootstrap {
        Bootstrap::Certificate => CertificateReply::Certificate(args.certificate),
        Bootstrap::Refused => CertificateReply::Refused,
        Bootstrap::Malformed => CertificateReply::Malformed,
        Bootstrap::Silent => CertificateReply::Silent,
        Bootstrap::Hangup => CertificateReply::Hangup,
    };

    let mock = MockUkey::bind(
        &args.listen,
        MockConfig {
            certificate,
            password: args.password,
        },
    )
    .await?;
    println!("Running on {}", mock.url());
    mock.serve_forever().await
}
