mod scrape;

use std::path::{Path, PathBuf};

use compact_str::CompactString;
use pbscr::output::DelimitedWriter;

const OUTPUT_PATH: &str = "data/all_posts.csv";

/// Scrapes posts from the ProBoards forum.
#[derive(clap::Parser)]
struct Args {
    /// Path of the webdriver executable.
    driver_path: PathBuf,
    /// Username for login.
    username: String,
    /// Password for login.
    password: String,
    /// Members to search.
    #[arg(required = true)]
    members: Vec<CompactString>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;

    pretty_env_logger::init_timed();

    let args = Args::parse();

    let (driver, process) = pbscr::scrape::get_driver(&args.driver_path, false).await?;

    let mut session =
        scrape::Session::new(driver, process, args.username, args.password, args.members);
    session.authenticate().await?;
    session.configure_search().await?;

    let mut writer = DelimitedWriter::create(Path::new(OUTPUT_PATH))?;
    writer.write_row(scrape::COLUMNS)?;

    let mut written = 0usize;
    while let Some(posts) = session.next_page().await? {
        for post in &posts {
            let timestamp = post.timestamp.timestamp_millis().to_string();
            let thread_id = post.thread_id.to_string();
            writer.write_row([
                timestamp.as_str(),
                post.thread_name.as_str(),
                thread_id.as_str(),
                post.text.as_str(),
            ])?;
        }
        written += posts.len();
        log::debug!(target: "writer", "{written} rows so far");
    }
    log::info!(target: "writer", "\x1b[36mwrote {written} rows to {OUTPUT_PATH}\x1b[0m");

    session.close().await
}
