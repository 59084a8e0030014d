// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgGroup, ArgMatches, Command};
use std::path::PathBuf;
use tunnelgate::{
  common::protocol::tunnel::WorkerId,
  util::validators::{
    parse_port, parse_relay_url, parse_seconds, parse_socketaddr, validate_existing_file,
    validate_port, validate_relay_url, validate_seconds, validate_socketaddr, validate_worker_id,
  },
};

mod client;
mod relay;
mod shutdown;
mod token;

fn init_logging(json: bool) {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
  let installed = if json {
    tracing::subscriber::set_global_default(builder.json().finish())
  } else {
    tracing::subscriber::set_global_default(builder.finish())
  };
  if let Err(e) = installed {
    eprintln!("Logger initialization failed: {e}");
  }
}

fn app() -> Command<'static> {
  Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .arg(
      Arg::new("json-logs")
        .long("json-logs")
        .help("Emit logs as JSON lines")
        .global(true),
    )
    .subcommand(
      Command::new("relay")
        .about("Accept worker registrations and forward requests to them")
        .arg(
          Arg::new("listen")
            .long("listen")
            .short('l')
            .validator(validate_socketaddr)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("cert")
            .long("cert")
            .short('c')
            .validator(validate_existing_file)
            .takes_value(true)
            .requires("key"),
        )
        .arg(
          Arg::new("key")
            .long("key")
            .short('k')
            .validator(validate_existing_file)
            .takes_value(true)
            .requires("cert"),
        )
        .arg(
          Arg::new("secret-a")
            .long("secret-a")
            .env("TUNNELGATE_SECRET_A")
            .hide_env_values(true)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("secret-b")
            .long("secret-b")
            .env("TUNNELGATE_SECRET_B")
            .hide_env_values(true)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("audience")
            .long("audience")
            .help("Require tokens that name an audience to include this one")
            .takes_value(true),
        )
        .arg(
          Arg::new("public-url")
            .long("public-url")
            .help("Externally reachable base URL, announced to registering workers")
            .validator(validate_relay_url)
            .takes_value(true),
        )
        .arg(grace_arg()),
    )
    .subcommand(
      Command::new("client")
        .about("Register with a relay and forward its requests to a local port")
        .arg(
          Arg::new("relay")
            .long("relay")
            .short('r')
            .validator(validate_relay_url)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("id")
            .long("id")
            .validator(validate_worker_id)
            .takes_value(true)
            .required(true),
        )
        .arg(Arg::new("token").long("token").takes_value(true))
        .arg(
          Arg::new("token-file")
            .long("token-file")
            .help("File holding the current token; re-read before every registration")
            .validator(validate_existing_file)
            .takes_value(true),
        )
        .group(
          ArgGroup::new("credential")
            .args(&["token", "token-file"])
            .required(true),
        )
        .arg(
          Arg::new("port")
            .long("port")
            .short('p')
            .validator(validate_port)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("url-file")
            .long("url-file")
            .help("Write the worker's public URL here once registered")
            .takes_value(true),
        )
        .arg(grace_arg()),
    )
    .subcommand(
      Command::new("token")
        .about("Mint a registration token for development use")
        .arg(
          Arg::new("id")
            .long("id")
            .validator(validate_worker_id)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("secret")
            .long("secret")
            .env("TUNNELGATE_SECRET_A")
            .hide_env_values(true)
            .takes_value(true)
            .required(true),
        )
        .arg(Arg::new("audience").long("audience").takes_value(true))
        .arg(
          Arg::new("lifetime")
            .long("lifetime")
            .help("Token lifetime in seconds")
            .validator(validate_seconds)
            .default_value("3600")
            .takes_value(true),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true)
}

fn grace_arg() -> Arg<'static> {
  Arg::new("grace")
    .long("grace")
    .help("Seconds to let in-flight connections finish after a shutdown signal")
    .validator(validate_seconds)
    .default_value("10")
    .takes_value(true)
}

fn main() {
  let matches = app().get_matches();
  init_logging(matches.is_present("json-logs"));
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let rt = match tokio::runtime::Builder::new_multi_thread()
    .thread_name("tunnelgate-worker")
    .enable_all()
    .build()
  {
    Ok(rt) => rt,
    Err(e) => {
      tracing::error!(err = ?e, "Tokio runtime setup failed");
      std::process::exit(1);
    }
  };
  match rt.block_on(main_args_handler(&matches)) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "Command failed");
      std::process::exit(1);
    }
    Ok(()) => tracing::info!("{} exited successfully", mode),
  }
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str> {
  args
    .value_of(name)
    .with_context(|| format!("--{name} is required"))
}

pub fn relay_arg_handling(args: &'_ ArgMatches) -> Result<relay::RelayArgs> {
  let tls = match (args.value_of("cert"), args.value_of("key")) {
    (Some(cert), Some(key)) => Some((PathBuf::from(cert), PathBuf::from(key))),
    _ => None,
  };
  Ok(relay::RelayArgs {
    listen: parse_socketaddr(required(args, "listen")?)?,
    tls,
    secret_a: required(args, "secret-a")?.to_string(),
    secret_b: required(args, "secret-b")?.to_string(),
    audience: args.value_of("audience").map(String::from),
    public_url: args.value_of("public-url").map(parse_relay_url).transpose()?,
    grace: parse_seconds(required(args, "grace")?)?,
  })
}

pub fn client_arg_handling(args: &'_ ArgMatches) -> Result<client::ClientArgs> {
  let token = match (args.value_of("token"), args.value_of("token-file")) {
    (Some(token), _) => client::TokenSource::Static(token.to_string()),
    (None, Some(path)) => client::TokenSource::File(PathBuf::from(path)),
    (None, None) => anyhow::bail!("One of --token or --token-file is required"),
  };
  Ok(client::ClientArgs {
    relay: parse_relay_url(required(args, "relay")?)?,
    id: WorkerId::parse(required(args, "id")?)?,
    token,
    port: parse_port(required(args, "port")?)?,
    url_file: args.value_of("url-file").map(PathBuf::from),
    grace: parse_seconds(required(args, "grace")?)?,
  })
}

pub fn token_arg_handling(args: &'_ ArgMatches) -> Result<token::TokenArgs> {
  Ok(token::TokenArgs {
    id: WorkerId::parse(required(args, "id")?)?,
    secret: required(args, "secret")?.to_string(),
    audience: args.value_of("audience").map(String::from),
    lifetime: parse_seconds(required(args, "lifetime")?)?,
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("relay", opts)) => {
      let config = relay_arg_handling(opts)?;
      tracing::info!("Running as relay with config {:#?}", config);
      relay::relay_main(config).await
    }
    Some(("client", opts)) => {
      let config = client_arg_handling(opts)?;
      tracing::info!("Running as client with config {:#?}", config);
      client::client_main(config).await
    }
    Some(("token", opts)) => token::token_main(token_arg_handling(opts)?),
    _ => anyhow::bail!("A subcommand is required"),
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::{app, client, client_arg_handling, relay_arg_handling};

  #[test]
  fn relay_arguments() {
    let matches = app()
      .try_get_matches_from([
        "tunnelgate",
        "relay",
        "--listen",
        "127.0.0.1:8080",
        "--secret-a",
        "a",
        "--secret-b",
        "b",
        "--public-url",
        "https://relay.example/",
      ])
      .unwrap();
    let (_, opts) = matches.subcommand().unwrap();
    let args = relay_arg_handling(opts).unwrap();
    assert_eq!(args.listen, "127.0.0.1:8080".parse().unwrap());
    assert!(args.tls.is_none());
    assert_eq!(args.public_url.as_deref(), Some("https://relay.example"));
    assert_eq!(args.grace, Duration::from_secs(10));
  }

  #[test]
  fn client_needs_exactly_one_credential() {
    let base = [
      "tunnelgate", "client", "--relay", "http://relay:80", "--id", "W1", "--port", "3000",
    ];
    assert!(app().try_get_matches_from(base).is_err());

    let mut with_token = base.to_vec();
    with_token.extend(["--token", "t"]);
    let matches = app().try_get_matches_from(with_token).unwrap();
    let (_, opts) = matches.subcommand().unwrap();
    let args = client_arg_handling(opts).unwrap();
    assert!(matches!(args.token, client::TokenSource::Static(ref t) if t == "t"));
    assert_eq!(args.port, 3000);

    let mut both = base.to_vec();
    both.extend(["--token", "t", "--token-file", "Cargo.toml"]);
    assert!(app().try_get_matches_from(both).is_err());
  }

  #[test]
  fn worker_ids_are_validated() {
    let result = app().try_get_matches_from([
      "tunnelgate", "client", "--relay", "http://relay", "--id", "bad/id", "--port", "3000",
      "--token", "t",
    ]);
    assert!(result.is_err());
  }
}
