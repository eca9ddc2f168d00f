//! `chainsink cursor`: show, set or reset the saved cursor.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;

use chainsink_core::{Cursor, CursorStore, FileCursorStore};

#[derive(Subcommand, Debug)]
pub enum CursorAction {
    /// Print the saved cursor
    Show {
        /// Cursor directory or file
        #[arg(long, env = "CHAINSINK_CURSOR_PATH", default_value = "./state")]
        cursor_path: PathBuf,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Overwrite the saved cursor, e.g. to skip a poisoned block
    Set {
        /// Cursor string (`c1:<block>:<id>:<final>:<final_id>[:undo]`)
        cursor: String,
        #[arg(long, env = "CHAINSINK_CURSOR_PATH", default_value = "./state")]
        cursor_path: PathBuf,
    },

    /// Delete the saved cursor so the next run starts from the range start
    Reset {
        #[arg(long, env = "CHAINSINK_CURSOR_PATH", default_value = "./state")]
        cursor_path: PathBuf,
    },
}

pub async fn run(action: CursorAction) -> Result<()> {
    match action {
        CursorAction::Show { cursor_path, json } => {
            let store = FileCursorStore::new(&cursor_path);
            let cursor = store.load().await?;
            println!("{}", render(store.path(), cursor.as_ref(), json)?);
            Ok(())
        }
        CursorAction::Set { cursor, cursor_path } => {
            let cursor: Cursor = cursor.parse().context("invalid cursor")?;
            let store = FileCursorStore::new(&cursor_path);
            store.save(&cursor).await?;
            println!("cursor set to {cursor} ({})", store.path().display());
            Ok(())
        }
        CursorAction::Reset { cursor_path } => {
            let store = FileCursorStore::new(&cursor_path);
            store.clear().await?;
            println!("cursor cleared ({})", store.path().display());
            Ok(())
        }
    }
}

fn render(path: &std::path::Path, cursor: Option<&Cursor>, json: bool) -> Result<String> {
    if json {
        let value = serde_json::json!({
            "path": path.display().to_string(),
            "cursor": cursor.map(|c| c.to_string()),
            "block": cursor.map(|c| c.block.number),
            "final_block": cursor.map(|c| c.final_block.number),
            "undo": cursor.map(|c| c.is_undo()),
        });
        return Ok(serde_json::to_string_pretty(&value)?);
    }
    Ok(match cursor {
        Some(c) => format!(
            "{c}\n  block:       {}\n  final block: {}\n  resumes at:  {}",
            c.block,
            c.final_block,
            c.next_block()
        ),
        None => format!("no cursor saved at {}", path.display()),
    })
}
