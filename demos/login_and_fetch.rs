use std::error::Error;

use frappe_client::{FrappeClient, ListOptions};
use secrecy::SecretString;
use serde_json::Value;

fn main() -> Result<(), Box<dyn Error>> {
    let username = "REPLACE_WITH_USERNAME".to_string();
    let password = "REPLACE_WITH_PASSWORD".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        // Reads FRAPPE_URL, defaulting to http://localhost:8000.
        let client = FrappeClient::from_env()?;

        client
            .login(&username, &SecretString::new(password))
            .await?;
        println!("logged in as {}", client.get_current_user().await?);

        let options = ListOptions::new()
            .fields(["name", "status"])
            .order_by("modified desc")
            .limit(10);
        let tasks: Vec<Value> = client.get_list("Task", &options).await?;
        for task in tasks {
            println!("{task}");
        }

        client.logout().await?;
        Ok::<(), Box<dyn Error>>(())
    })
}
