//! End-to-end demo binary for locfetch.
//!
//! Run with: cargo run -p locfetch-test

use locfetch::LocationFetcher;

#[tokio::main]
async fn main() {
    println!("=== locfetch demo ===\n");

    let fetcher = LocationFetcher::shared();
    println!(
        "Fetching current location (timeout {:?})...",
        fetcher.config().timeout
    );

    match fetcher.fetch_current_location().await {
        Ok(location) => {
            println!("✓ Location retrieved!");
            println!("  Latitude:  {:.6}°", location.latitude);
            println!("  Longitude: {:.6}°", location.longitude);
            if let Some(altitude) = location.altitude {
                println!("  Altitude:  {altitude:.1}m");
            }
            if let Some(accuracy) = location.horizontal_accuracy {
                println!("  Accuracy:  {accuracy:.1}m");
            }
            println!("  Timestamp: {}", location.timestamp);

            match serde_json::to_string_pretty(&location) {
                Ok(json) => println!("\nAs JSON:\n{json}"),
                Err(e) => println!("Failed to serialize location: {e}"),
            }
        }
        Err(e) => println!("✗ Failed to get location: {e}"),
    }
}
