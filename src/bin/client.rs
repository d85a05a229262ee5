use ldc::{ConnectOptions, Connection, SearchOpts};
use std::time::Duration;

async fn run(url: &str, base: &str, filter: &str) -> ldc::Result<()> {
    let options = ConnectOptions {
        network_timeout: Some(Duration::from_secs(5)),
        ..ConnectOptions::default()
    };
    let conn = Connection::connect(&[url], options).await?;
    conn.simple_bind(None, None).await?;

    let mut stream = conn
        .search(SearchOpts::base(base).filter(filter))
        .await?;
    let mut count = 0;
    while let Some(entry) = stream.next().await? {
        println!("dn: {}", entry.dn);
        for attr in &entry.attrs {
            for value in &attr.values {
                println!("{}: {}", attr.name, String::from_utf8_lossy(value));
            }
        }
        println!();
        count += 1;
    }
    println!("# {} entries, result {:?}", count, stream.done());
    conn.unbind().await
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let url = args.get(1).map(String::as_str).unwrap_or("ldap://127.0.0.1:389");
    let base = args.get(2).map(String::as_str).unwrap_or("");
    let filter = args.get(3).map(String::as_str).unwrap_or("(objectClass=*)");

    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        if let Err(e) = run(url, base, filter).await {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    });
}
