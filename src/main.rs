use clap::{crate_version, App, Arg};
use hypertwo::{Client, Url};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = App::new("hypertwo")
        .version(crate_version!())
        .arg(Arg::with_name("url").required(true).index(1))
        .get_matches();
    let url = Url::parse(matches.value_of("url").expect("missing url"))?;

    let client = Client::default();
    let response = client.get(url).await?;
    println!("{}", response.text());
    Ok(())
}
