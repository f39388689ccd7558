use anyhow::Result;
use std::io::Write;
use structopt::StructOpt;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(StructOpt, Debug)]
#[structopt(name = "sqlcluster")]
struct Opt {
    /// HTTP address of any cluster node.
    #[structopt(short, long, default_value = "127.0.0.1:4001")]
    node: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();
    let opt = Opt::from_args();
    let url = format!("http://{}/sql", opt.node.trim_start_matches("http://"));
    let client = reqwest::Client::new();
    let stdin = tokio::io::stdin();
    let rdr = BufReader::new(stdin);
    let mut lines = rdr.lines();
    print!("sqlcluster> ");
    std::io::stdout().flush()?;
    while let Some(line) = lines.next_line().await? {
        if !line.trim().is_empty() {
            match client.post(&url).body(line).send().await {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await?;
                    if status.is_success() {
                        print!("{}", body);
                    } else {
                        println!("[{}] {}", status, body.trim_end());
                    }
                }
                Err(e) => println!("request failed: {}", e),
            }
        }
        print!("sqlcluster> ");
        std::io::stdout().flush()?;
    }
    Ok(())
}
