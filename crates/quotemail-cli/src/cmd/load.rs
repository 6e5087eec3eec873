use crate::cmd::{load_cipher, load_contacts};
use crate::output::{print_json, print_table};
use quotemail_core::{config::Config, mask::mask_email};
use std::path::Path;

pub fn run(root: &Path, file: &Path, encoding: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = Config::load_or_default(root)?;
    let cipher = load_cipher(root, &config)?;
    let result = load_contacts(file, cipher.as_ref(), encoding)?;

    if json {
        let records: Vec<_> = result
            .records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "company_name": r.company_name,
                    "contact_name": r.contact_name,
                    "email": mask_email(&r.email),
                    "department": r.department,
                })
            })
            .collect();
        print_json(&serde_json::json!({
            "encoding": result.encoding,
            "records": records,
            "errors": result.errors,
            "warnings": result.warnings,
        }))?;
        return Ok(());
    }

    println!("{} record(s) loaded ({})", result.records.len(), result.encoding);
    if !result.records.is_empty() {
        let rows = result
            .records
            .iter()
            .map(|r| {
                vec![
                    r.company_name.clone(),
                    r.contact_name.clone(),
                    mask_email(&r.email),
                    r.department.clone(),
                ]
            })
            .collect();
        print_table(&["COMPANY", "CONTACT", "EMAIL", "DEPARTMENT"], rows);
    }
    for w in &result.warnings {
        eprintln!("warning: {w}");
    }
    for e in &result.errors {
        eprintln!("skipped: {e}");
    }
    Ok(())
}
