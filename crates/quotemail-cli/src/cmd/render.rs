use crate::cmd::{load_cipher, load_contacts, load_templates, ProductArgs};
use crate::output::print_json;
use quotemail_core::{
    config::Config,
    fingerprint::{normalize_subject, ProductInfo},
    mask::mask_email,
    template::Variables,
};
use std::path::Path;

pub fn run(
    root: &Path,
    file: &Path,
    template: Option<&Path>,
    subject: Option<&str>,
    row: usize,
    product: ProductArgs,
    json: bool,
) -> anyhow::Result<()> {
    let config = Config::load_or_default(root)?;
    let cipher = load_cipher(root, &config)?;
    let loaded = load_contacts(file, cipher.as_ref(), None)?;
    let (subject_tpl, body_tpl) = load_templates(template, subject)?;

    let contact = row
        .checked_sub(1)
        .and_then(|i| loaded.records.get(i))
        .ok_or_else(|| {
            anyhow::anyhow!(
                "row {row} out of range: {} valid record(s) loaded",
                loaded.records.len()
            )
        })?;

    let product: ProductInfo = product.into();
    let vars = Variables::for_request(contact, &product);
    let strict = config.template_strict;
    let subject = normalize_subject(&subject_tpl.render(&vars, strict)?);
    let body = body_tpl.render(&vars, strict)?;
    let mut unresolved = subject_tpl.missing(&vars);
    unresolved.extend(body_tpl.missing(&vars));

    if json {
        print_json(&serde_json::json!({
            "to": mask_email(&contact.email),
            "subject": subject,
            "body": body,
            "unresolved": unresolved,
        }))?;
        return Ok(());
    }

    println!("To:      {}", mask_email(&contact.email));
    println!("Subject: {subject}");
    println!();
    println!("{body}");
    if !unresolved.is_empty() {
        eprintln!("warning: unresolved variable(s): {}", unresolved.join(", "));
    }
    Ok(())
}
