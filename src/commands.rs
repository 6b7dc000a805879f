//! Command-line surface

use clap::{Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::queue::MutationKind;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Persist a mutation in the offline queue
  Enqueue {
    #[arg(short, long, value_enum)]
    kind: KindArg,
    #[arg(short, long)]
    collection: String,
    /// Record as JSON; update and delete need an "id" field
    #[arg(short, long)]
    payload: String,
  },
  /// Queue a photo for upload with the next drain
  EnqueuePhoto {
    file: PathBuf,
    #[arg(long, default_value = "image/jpeg")]
    content_type: String,
    /// JSON metadata; a "path" field sets the upload object name
    #[arg(long)]
    metadata: Option<String>,
  },
  /// Write now if online and signed in, otherwise queue
  Submit {
    #[arg(short, long, value_enum)]
    kind: KindArg,
    #[arg(short, long)]
    collection: String,
    #[arg(short, long)]
    payload: String,
    /// Skip the connectivity probe and treat the network as reachable
    #[arg(long)]
    assume_online: bool,
  },
  /// List pending mutations in replay order
  Pending,
  /// Number of pending mutations
  Count,
  /// Run one drain of the queue
  Sync {
    #[arg(long)]
    assume_online: bool,
  },
  /// Long-running agent: probe, timer and identity mirror
  Run,
  /// Items that were abandoned after failing
  DeadLetters {
    #[arg(long)]
    clear: bool,
  },
  /// Remove the stored profile and every queued item
  Logout,
  /// Stored identity
  Profile {
    #[command(subcommand)]
    action: ProfileCommand,
  },
  /// Cache gateway
  Gateway {
    #[command(subcommand)]
    action: GatewayCommand,
  },
}

#[derive(Subcommand, Debug)]
pub enum ProfileCommand {
  Show,
  Clear,
}

#[derive(Subcommand, Debug)]
pub enum GatewayCommand {
  /// Precache the app shell as this version's generation
  Install,
  /// Make this version live and delete older generations
  Activate,
  /// Install then activate
  Deploy,
  /// Request a URL through the gateway
  Fetch {
    /// Absolute URL or path on the app origin
    url: String,
    /// Treat as a top-level page load
    #[arg(long)]
    navigate: bool,
  },
  /// List cache generations
  Caches,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindArg {
  Create,
  Update,
  Delete,
}

impl From<KindArg> for MutationKind {
  fn from(kind: KindArg) -> Self {
    match kind {
      KindArg::Create => MutationKind::Create,
      KindArg::Update => MutationKind::Update,
      KindArg::Delete => MutationKind::Delete,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use clap::Parser;

  #[derive(Parser, Debug)]
  struct Cli {
    #[command(subcommand)]
    command: Command,
  }

  #[test]
  fn test_parse_enqueue() {
    let cli = Cli::try_parse_from([
      "geopoint-sync",
      "enqueue",
      "--kind",
      "update",
      "--collection",
      "tareas",
      "--payload",
      r#"{"id":"t1","estado":"hecho"}"#,
    ])
    .unwrap();

    match cli.command {
      Command::Enqueue {
        kind, collection, ..
      } => {
        assert_eq!(MutationKind::from(kind), MutationKind::Update);
        assert_eq!(collection, "tareas");
      }
      other => panic!("unexpected command: {:?}", other),
    }
  }

  #[test]
  fn test_parse_gateway_fetch() {
    let cli = Cli::try_parse_from([
      "geopoint-sync",
      "gateway",
      "fetch",
      "/menu.html?uid=123",
      "--navigate",
    ])
    .unwrap();

    assert!(matches!(
      cli.command,
      Command::Gateway {
        action: GatewayCommand::Fetch { navigate: true, .. }
      }
    ));
  }

  #[test]
  fn test_unknown_kind_rejected() {
    let result = Cli::try_parse_from([
      "geopoint-sync",
      "enqueue",
      "--kind",
      "upsert",
      "--collection",
      "tareas",
      "--payload",
      "{}",
    ]);
    assert!(result.is_err());
  }
}
