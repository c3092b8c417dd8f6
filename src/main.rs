use modhost::host_app;
use modhost::server::Server;

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    let configuration = host_app::parse_command_line()?;
    let server = Server::new(configuration)?;
    server.start().await
}
