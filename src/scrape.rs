use core::time::Duration;
use std::{path::Path, process::Stdio};

use fantoccini::{Client, ClientBuilder};
use serde_json::json;
use tokio::{
    process::{Child, Command},
    time::sleep,
};

pub const WEBDRIVER_PORT: u16 = 9515;

/// Start the webdriver executable at `path` and connect a session to it.
///
/// The returned child is killed when dropped, so an aborted run does not
/// leave a driver process behind.
pub async fn get_driver(path: &Path, headless: bool) -> anyhow::Result<(Client, Child)> {
    const PERIOD: Duration = Duration::from_millis(500);

    let child = Command::new(path)
        .arg(format!("--port={WEBDRIVER_PORT}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let mut builder = ClientBuilder::native();
    if headless {
        builder.capabilities(
            Some((
                "goog:chromeOptions".to_owned(),
                json!({ "args": ["--headless=new"] }),
            ))
            .into_iter()
            .collect(),
        );
    }

    // The driver takes a moment to start listening.
    let url = format!("http://localhost:{WEBDRIVER_PORT}");
    for _ in 0..9 {
        match builder.connect(&url).await {
            Ok(client) => return Ok((client, child)),
            Err(e) => {
                tracing::info!(target: "driver", "webdriver not ready: {e}");
                sleep(PERIOD).await;
            }
        }
    }
    let client = builder.connect(&url).await?;
    Ok((client, child))
}
