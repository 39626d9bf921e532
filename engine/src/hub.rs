use std::{collections::BTreeSet, path::PathBuf};

use color_eyre::{
    Result,
    eyre::{WrapErr as _, eyre},
};
use hf_hub::api::tokio::{Api, ApiBuilder};
use log::debug;

use crate::config::Config;

/// Hub client, built once per program from the [`Config`].
#[derive(Clone)]
pub struct Hub {
    api: Api,
}

impl Hub {
    pub fn new(config: &Config) -> Result<Self> {
        let mut builder = ApiBuilder::new().with_progress(true);
        if let Some(dir) = &config.hub_cache_dir {
            builder = builder.with_cache_dir(dir.clone());
        }
        Ok(Self {
            api: builder.build()?,
        })
    }

    pub fn model(&self, repo_id: &str) -> ModelRepo {
        ModelRepo {
            id: repo_id.to_string(),
            api: self.api.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ModelRepo {
    id: String,
    api: Api,
}

impl ModelRepo {
    pub async fn get(&self, file: &str) -> Result<PathBuf> {
        debug!("Fetching {}/{file}", self.id);
        self.api
            .model(self.id.clone())
            .get(file)
            .await
            .wrap_err_with(|| format!("fetching {file} from {}", self.id))
    }

    /// Either the single `model.safetensors` or all shards listed in the index.
    pub async fn get_safetensors(&self) -> Result<Vec<PathBuf>> {
        match self.get("model.safetensors").await {
            Ok(path) => Ok(vec![path]),
            Err(single_err) => {
                debug!("No single weights file in {}: {single_err:?}", self.id);
                let index = self.get("model.safetensors.index.json").await?;
                let index = std::fs::read_to_string(index)?;
                let mut paths = vec![];
                for file in weight_files_from_index(&index)? {
                    paths.push(self.get(&file).await?);
                }
                Ok(paths)
            }
        }
    }
}

pub fn weight_files_from_index(index_json: &str) -> Result<Vec<String>> {
    let index: serde_json::Value = serde_json::from_str(index_json)?;
    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| eyre!("no weight_map in safetensors index"))?;

    let files = weight_map
        .values()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| eyre!("weight_map entry is not a string: {v}"))
        })
        .collect::<Result<BTreeSet<_>>>()?;

    Ok(files.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use expect_test::expect;

    use super::*;

    #[test]
    fn shards_are_deduplicated_and_sorted() -> Result<()> {
        let index = r#"{
            "metadata": {"total_size": 123},
            "weight_map": {
                "lm_head.weight": "model-00002-of-00002.safetensors",
                "model.embed_tokens.weight": "model-00001-of-00002.safetensors",
                "model.norm.weight": "model-00002-of-00002.safetensors"
            }
        }"#;

        expect![[r#"
            [
                "model-00001-of-00002.safetensors",
                "model-00002-of-00002.safetensors",
            ]
        "#]]
        .assert_debug_eq(&weight_files_from_index(index)?);
        Ok(())
    }

    #[test]
    fn index_without_weight_map() {
        let err = weight_files_from_index(r#"{"metadata": {}}"#).unwrap_err();
        assert!(err.to_string().contains("no weight_map"));
    }
}
