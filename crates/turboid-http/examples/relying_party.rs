//! Relying-party walkthrough
//!
//! Discovers the provider for an identifier, prints the `checkid_setup`
//! redirect, then verifies the query string pasted back from the browser.
//!
//! ```bash
//! cargo run -p turboid-http --example relying_party -- https://alice.example.com/
//! ```

use std::io::BufRead;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use turboid::{Consumer, ConsumerConfig, VerificationOutcome};
use turboid_http::{HtmlDiscovery, HttpTransport};

const RETURN_TO: &str = "http://localhost:8080/openid/return";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let identifier = std::env::args()
        .nth(1)
        .ok_or("usage: relying_party <identifier>")?;

    let consumer = Consumer::builder(
        Arc::new(HttpTransport::new()?),
        Arc::new(HtmlDiscovery::new()?),
    )
    .config(ConsumerConfig::default())
    .build();

    let request = consumer
        .checkid_setup(&identifier, RETURN_TO, Some("http://localhost:8080/"), None)
        .await?;

    println!("Provider:   {}", request.endpoint.server_url);
    println!("Claimed ID: {}", request.endpoint.claimed_id);
    match &request.assoc_handle {
        Some(handle) => println!("Handle:     {handle}"),
        None => println!("Handle:     none (stateless)"),
    }
    println!("\nOpen this URL in a browser:\n\n{}\n", request.redirect_url);
    println!("Paste the query string of the return URL:");

    let mut query = String::new();
    std::io::stdin().lock().read_line(&mut query)?;
    let query = query.trim().trim_start_matches(RETURN_TO).trim_start_matches('?');

    match consumer
        .verify_query(query, &request.endpoint.claimed_id, None)
        .await
    {
        Ok(VerificationOutcome::Verified(who)) => {
            println!("Signed in as {} via {}", who.identity, who.provider);
        }
        Ok(VerificationOutcome::SetupNeeded { user_setup_url }) => {
            println!("Provider needs interaction: {user_setup_url:?}");
        }
        Err(e) if e.is_security_event() => {
            eprintln!("Rejected assertion: {e}");
        }
        Err(e) => eprintln!("Verification failed: {e}"),
    }

    Ok(())
}
