use std::time::Duration;

use indexhub_types::config::{CloudConfig, RepositoryConfig, RepositoryType};
use regex::Regex;
use rusty_s3::actions::{CreateBucket, S3Action as _};
use rusty_s3::{Bucket, Credentials, UrlStyle};
use serde_json::{json, Value};
use tracing::{info, warn};
use url::Url;

use crate::clients::SearchEngine;
use crate::{Error, Result};

/// Expands `%(key)s` placeholders in the repository name and in every
/// string setting, resolving keys against the index `_meta`. Repository
/// configs are dynamic: they potentially change for each index snapshotted.
///
/// Unknown keys fail closed rather than leaving literal placeholders in
/// final values.
pub fn expand_repository(
    conf: &RepositoryConfig,
    index_meta: &serde_json::Map<String, Value>,
) -> Result<RepositoryConfig> {
    let mut expanded = conf.clone();
    expanded.name = expand_template(&conf.name, index_meta)?;
    for (setting, value) in &conf.settings {
        if let Value::String(text) = value {
            expanded
                .settings
                .insert(setting.clone(), Value::String(expand_template(text, index_meta)?));
        }
    }
    Ok(expanded)
}

fn expand_template(template: &str, index_meta: &serde_json::Map<String, Value>) -> Result<String> {
    let placeholder = Regex::new(r"%\(([^)]+)\)s").unwrap();
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for capture in placeholder.captures_iter(template) {
        let whole = capture.get(0).unwrap();
        let key = &capture[1];
        let value = index_meta.get(key).ok_or_else(|| {
            Error::Config(format!("unknown template key `{key}` in `{template}`"))
        })?;
        out.push_str(&template[last..whole.start()]);
        match value {
            Value::String(text) => out.push_str(text),
            other => out.push_str(&other.to_string()),
        }
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Makes sure the repository exists on the engine, creating whatever is
/// missing. An `s3` repository gets its bucket established first; an `fs`
/// repository assumes the mount is present; other types pass their settings
/// through unchanged.
pub async fn ensure_repository(
    engine: &dyn SearchEngine,
    http: &reqwest::Client,
    conf: &RepositoryConfig,
    cloud: Option<&CloudConfig>,
) -> Result<()> {
    if engine.get_repository(&conf.name).await?.is_some() {
        return Ok(());
    }

    if conf.kind == RepositoryType::S3 {
        ensure_bucket(http, conf, cloud).await?;
    }
    let body = json!({
        "type": conf.kind.as_str(),
        "settings": conf.settings,
    });
    info!(repository = %conf.name, body = %body, "creating repository");
    engine.create_repository(&conf.name, &body).await?;
    Ok(())
}

/// Creates the backing S3 bucket if it is missing; an already-owned bucket
/// answers 409 and is accepted.
async fn ensure_bucket(
    http: &reqwest::Client,
    conf: &RepositoryConfig,
    cloud: Option<&CloudConfig>,
) -> Result<()> {
    let Some(cloud) = cloud else {
        warn!(repository = %conf.name, "no cloud credentials, assuming the bucket exists");
        return Ok(());
    };
    let name = conf
        .settings
        .get("bucket")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            Error::Config(format!("s3 repository `{}` has no `bucket` setting", conf.name))
        })?
        .to_owned();
    let region = conf
        .settings
        .get("region")
        .and_then(Value::as_str)
        .unwrap_or("us-east-1")
        .to_owned();
    let endpoint = match conf.settings.get("endpoint").and_then(Value::as_str) {
        Some(endpoint) => endpoint.to_owned(),
        None => format!("https://s3.{region}.amazonaws.com"),
    };
    let endpoint: Url = endpoint
        .parse()
        .map_err(|err| Error::Config(format!("invalid s3 endpoint: {err}")))?;

    let bucket = Bucket::new(endpoint, UrlStyle::VirtualHost, name.clone(), region)
        .map_err(|err| Error::Config(format!("invalid s3 bucket `{name}`: {err}")))?;
    let credentials = Credentials::new(cloud.access_key.clone(), cloud.secret_key.clone());
    let action = CreateBucket::new(&bucket, &credentials);
    let url = action.sign(Duration::from_secs(60));

    let mut request = http.put(url);
    if let Some(acl) = &conf.acl {
        request = request.header("x-amz-acl", acl);
    }
    let response = request.send().await?;
    match response.status().as_u16() {
        // 409: bucket already exists, which is what we wanted
        status if response.status().is_success() || status == 409 => {
            info!(bucket = %name, "bucket ready");
            Ok(())
        }
        status => Err(Error::Engine {
            status,
            message: response.text().await.unwrap_or_default(),
        }),
    }
}
