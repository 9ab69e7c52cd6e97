use crate::capture::Sniffer;
use crate::cli::Cli;
use crate::exec::KubeChannel;
use crate::k8s::K8sClient;
use crate::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub async fn handle_command(cli: Cli) -> Result<()> {
    let config = cli.sniff_config();
    config.validate()?;

    let client = K8sClient::connect(cli.context.as_deref(), config.connect_timeout).await?;
    let target = client
        .resolve_target(&cli.namespace, &cli.pod, cli.container.as_deref())
        .await?;
    let destination = cli.destination(&config);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, stopping capture");
                on_interrupt.cancel();
            }
            Err(e) => debug!("Failed to listen for interrupt: {}", e),
        }
    });

    let mut sniffer = Sniffer::new(KubeChannel::new(client.client()), target, config);
    sniffer.run(destination, cancel).await
}
