//! `taskq status`: queue overview, grouped by status or as JSON.

use anyhow::{Result, bail};

use crate::paths::QueuePaths;
use crate::store::{TaskRecord, TaskStatus};

use super::open_store;

pub fn status(paths: &QueuePaths, id: Option<&str>, json: bool) -> Result<i32> {
    let store = open_store(paths)?;
    let mut records = store.list()?;

    if let Some(id) = id {
        records.retain(|r| r.id == id);
        if records.is_empty() {
            bail!("No task found with id: {id}");
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print_grouped(&records);
    }
    Ok(0)
}

fn print_grouped(records: &[TaskRecord]) {
    for status in TaskStatus::ALL {
        let group: Vec<&TaskRecord> = records.iter().filter(|r| r.status == status).collect();
        if group.is_empty() {
            continue;
        }
        println!("\n{}:", status.as_str().to_uppercase());
        for record in group {
            println!("  {}", record.id);
        }
    }
}
