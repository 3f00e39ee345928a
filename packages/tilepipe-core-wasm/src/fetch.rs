use std::cell::Cell;
use std::collections::HashMap;

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use js_sys::Uint8Array;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::JsFuture;

use crate::cancellation::RequestKind;
use crate::error::PipelineError;
use crate::tile::TileKey;

#[wasm_bindgen]
extern "C" {
    // Host helper: resolves to the response body (ArrayBuffer or Uint8Array)
    #[wasm_bindgen(js_namespace = wasmJsHelpers, js_name = fetch, catch)]
    fn js_fetch(url: &str, method: &str) -> Result<js_sys::Promise, JsValue>;
}

/// Source of raw tile bytes. The returned future may be polled on any
/// executor; results are marshalled back by the dispatcher.
pub trait TileFetcher {
    fn fetch(
        &self,
        tile: &TileKey,
        kind: RequestKind,
    ) -> LocalBoxFuture<'static, Result<Vec<u8>, PipelineError>>;
}

/// Tile URL with `{z}`, `{x}` and `{y}` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct UrlTemplate {
    template: String,
}

impl UrlTemplate {
    pub fn new(template: &str) -> Result<Self, PipelineError> {
        for placeholder in ["{z}", "{x}", "{y}"] {
            if !template.contains(placeholder) {
                return Err(PipelineError::Config(format!(
                    "url template '{}' lacks {}",
                    template, placeholder
                )));
            }
        }
        Ok(Self {
            template: template.to_string(),
        })
    }

    pub fn url(&self, tile: &TileKey) -> String {
        self.template
            .replace("{z}", &tile.z.to_string())
            .replace("{x}", &tile.x.to_string())
            .replace("{y}", &tile.y.to_string())
    }
}

fn js_error_text(err: &JsValue) -> String {
    err.as_string().unwrap_or_else(|| format!("{:?}", err))
}

/// Fetches through the host page's `wasmJsHelpers.fetch`.
#[derive(Debug, Clone)]
pub struct JsTileFetcher {
    template: UrlTemplate,
}

impl JsTileFetcher {
    pub fn new(template: UrlTemplate) -> Self {
        Self { template }
    }
}

impl TileFetcher for JsTileFetcher {
    fn fetch(
        &self,
        tile: &TileKey,
        kind: RequestKind,
    ) -> LocalBoxFuture<'static, Result<Vec<u8>, PipelineError>> {
        let url = self.template.url(tile);
        let tile_name = tile.to_string();
        let method = match kind {
            RequestKind::Get => "GET",
            RequestKind::Head => "HEAD",
        };

        async move {
            let failed = |err: JsValue| PipelineError::Fetch {
                tile: tile_name.clone(),
                reason: js_error_text(&err),
            };
            let promise = js_fetch(&url, method).map_err(failed)?;
            let body = JsFuture::from(promise).await.map_err(failed)?;
            if body.is_undefined() || body.is_null() {
                return Ok(Vec::new());
            }
            Ok(Uint8Array::new(&body).to_vec())
        }
        .boxed_local()
    }
}

/// Serves tiles from memory, e.g. preloaded or bundled data. Missing tiles
/// fail like a 404 would.
#[derive(Debug, Default)]
pub struct MemoryTileFetcher {
    tiles: HashMap<TileKey, Vec<u8>>,
    fetches: Cell<usize>,
}

impl MemoryTileFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tile: TileKey, data: Vec<u8>) {
        self.tiles.insert(tile, data);
    }

    /// How many fetches were started.
    pub fn fetch_count(&self) -> usize {
        self.fetches.get()
    }
}

impl TileFetcher for MemoryTileFetcher {
    fn fetch(
        &self,
        tile: &TileKey,
        kind: RequestKind,
    ) -> LocalBoxFuture<'static, Result<Vec<u8>, PipelineError>> {
        self.fetches.set(self.fetches.get() + 1);
        let result = match (self.tiles.get(tile), kind) {
            (Some(_), RequestKind::Head) => Ok(Vec::new()),
            (Some(data), RequestKind::Get) => Ok(data.clone()),
            (None, _) => Err(PipelineError::Fetch {
                tile: tile.to_string(),
                reason: "not found".to_string(),
            }),
        };
        futures::future::ready(result).boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn template_substitutes_coordinates() {
        let template = UrlTemplate::new("https://tiles.example/{z}/{x}/{y}.pbf").unwrap();
        assert_eq!(
            template.url(&TileKey::new(14, 8529, 5975)),
            "https://tiles.example/14/8529/5975.pbf"
        );
    }

    #[test]
    fn template_requires_every_placeholder() {
        let err = UrlTemplate::new("https://tiles.example/{z}/{x}.pbf").unwrap_err();
        assert!(matches!(err, PipelineError::Config(msg) if msg.contains("{y}")));
    }

    #[test]
    fn memory_fetcher_serves_and_counts() {
        let tile = TileKey::new(1, 0, 1);
        let mut fetcher = MemoryTileFetcher::new();
        fetcher.insert(tile, vec![1, 2, 3]);

        assert_eq!(block_on(fetcher.fetch(&tile, RequestKind::Get)), Ok(vec![1, 2, 3]));
        assert_eq!(block_on(fetcher.fetch(&tile, RequestKind::Head)), Ok(vec![]));
        assert!(block_on(fetcher.fetch(&TileKey::new(1, 1, 1), RequestKind::Get)).is_err());
        assert_eq!(fetcher.fetch_count(), 3);
    }
}
