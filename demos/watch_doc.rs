use std::error::Error;

use frappe_client::FrappeClient;

fn main() -> Result<(), Box<dyn Error>> {
    let doctype = "Task".to_string();
    let name = "REPLACE_WITH_DOC_NAME".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = FrappeClient::from_env()?;

        let subscription = client
            .realtime()
            .subscribe_doc(&doctype, Some(&name), move |payload| {
                println!("update: {payload}");
            })
            .await?;
        println!("watching {}", subscription.channel());

        tokio::signal::ctrl_c().await?;

        subscription.unsubscribe();
        client.realtime().disconnect().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
