//! Bootstrap node list: load from disk, refresh from the public node directory, merge, persist.

use std::path::Path;

use serde::Deserialize;
use toxpup_core::{BootstrapNode, Fetcher};
use tracing::{debug, error, info, warn};

/// Built-in seeds used when the node file is missing or broken.
const DEFAULT_NODES: &[(&str, u16, &str, &str)] = &[
    ("8E7D0B859922EF569298B4D261A8CCB5FEA14FB91ED412A7603A585A25698832", 33445, "85.172.30.117", "ray65536"),
    ("DA4E4ED4B697F2E9B000EEFE3A34B554ACD3F45F5C96EAEA2516DD7FF9AF7B43", 33445, "185.25.116.107", "MAH69K"),
    ("1C5293AEF2114717547B39DA8EA6F1E331E5E358B35F9B6B5F19317911C5F976", 33445, "tox.verdict.gg", "Deliran"),
    ("2C289F9F37C20D09DA83565588BF496FAB3764853FA38141817A72E3F18ACA0B", 33445, "163.172.136.118", "LittleVulpix"),
    ("3F0A45A268367C1BEA652F258C85F4A66DA76BCAA667A49E770BCC4917AB6A25", 33445, "tox.initramfs.io", "initramfs"),
    ("15E9C309CFCB79FDDF0EBA057DABB49FE15F3803B1BFF06536AE2E5BA5E4690E", 33445, "tox.neuland.technology", "Nolz"),
    ("10C00EB250C3233E343E2AEBA07115A5C28920E9C8D29492F6D00B29049EDC7E", 33445, "tox.abilinski.com", "AnthonyBilinski"),
    ("D527E5847F8330D628DAB1814F0A422F6DC9D0A300E6C357634EE2DA88C35463", 33445, "tox.novg.net", "blind_oracle"),
    ("2555763C8C460495B14157D234DD56B86300A2395554BCAE4621AC345B8C1B1B", 443, "185.14.30.213", "dvor"),
    ("82EF82BA33445A1F91A7DB27189ECFC0C013E06E3DA71F588ED692BED625EC23", 33445, "tox.kurnevsky.net", "kurnevsky"),
    ("F404ABAA1C99A9D37D61AB54898F56793E1DEF8BD46B1038B9D822E8460FAB67", 33445, "node.tox.biribiri.org", "nurupo"),
    ("8EF12E275BA9CD7D56625D4950F2058B06D5905D0650A1FE76AF18DB986DF760", 33445, "tox.yikifish.com", "ytexas"),
];

pub fn default_nodes() -> Vec<BootstrapNode> {
    DEFAULT_NODES
        .iter()
        .map(|(key, port, address, maintainer)| BootstrapNode {
            address: address.to_string(),
            port: *port,
            key: key.to_string(),
            maintainer: Some(maintainer.to_string()),
        })
        .collect()
}

/// Node directory response: `{"nodes": [...]}`.
#[derive(Debug, Deserialize)]
struct NodeDirectory {
    #[serde(default)]
    nodes: Option<Vec<RemoteNode>>,
}

#[derive(Debug, Deserialize)]
struct RemoteNode {
    public_key: String,
    port: u16,
    ipv4: String,
    #[serde(default)]
    maintainer: Option<String>,
}

impl From<RemoteNode> for BootstrapNode {
    fn from(n: RemoteNode) -> Self {
        BootstrapNode {
            address: n.ipv4,
            port: n.port,
            key: n.public_key,
            maintainer: n.maintainer,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodesError {
    #[error("invalid node directory json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("node directory has no node list")]
    MissingNodes,
}

/// Read the node file, falling back to the built-in list.
pub fn load(path: &Path) -> Vec<BootstrapNode> {
    let parsed = std::fs::read(path)
        .map_err(anyhow::Error::from)
        .and_then(|raw| Ok(serde_json::from_slice::<Vec<BootstrapNode>>(&raw)?));
    match parsed {
        Ok(nodes) => {
            debug!(path = %path.display(), count = nodes.len(), "loaded bootstrap nodes");
            nodes
        }
        Err(err) => {
            warn!(path = %path.display(), %err, "bootstrap node file unusable, using defaults");
            default_nodes()
        }
    }
}

fn parse_directory(body: &[u8]) -> Result<Vec<BootstrapNode>, NodesError> {
    let dir: NodeDirectory = serde_json::from_slice(body)?;
    let nodes = dir.nodes.ok_or(NodesError::MissingNodes)?;
    Ok(nodes.into_iter().map(BootstrapNode::from).collect())
}

/// Merge by key: known keys are replaced in place, new ones appended.
/// Returns (replaced, added).
pub fn merge(current: &mut Vec<BootstrapNode>, fresh: Vec<BootstrapNode>) -> (usize, usize) {
    let (mut replaced, mut added) = (0, 0);
    for node in fresh {
        match current.iter_mut().find(|n| n.key == node.key) {
            Some(slot) => {
                *slot = node;
                replaced += 1;
            }
            None => {
                current.push(node);
                added += 1;
            }
        }
    }
    (replaced, added)
}

/// Load the node file and, when `url` is given, merge the published list into it
/// and write the result back. Download or parse failures keep the local list.
pub async fn refresh(path: &Path, url: Option<&str>, fetcher: &dyn Fetcher) -> Vec<BootstrapNode> {
    let mut nodes = load(path);
    let Some(url) = url else {
        return nodes;
    };
    let body = match fetcher.fetch(url).await {
        Ok(body) => body,
        Err(err) => {
            warn!(%err, "unable to fetch bootstrap node list, keeping current one");
            return nodes;
        }
    };
    let fresh = match parse_directory(&body) {
        Ok(fresh) => fresh,
        Err(err) => {
            warn!(%err, "fetched node list unusable, keeping current one");
            return nodes;
        }
    };
    let (replaced, added) = merge(&mut nodes, fresh);
    info!(replaced, added, total = nodes.len(), "bootstrap nodes updated");

    match serde_json::to_vec(&nodes) {
        Ok(raw) => {
            if let Err(err) = tokio::fs::write(path, raw).await {
                error!(path = %path.display(), %err, "unable to write node file");
            }
        }
        Err(err) => error!(%err, "unable to encode node list"),
    }
    nodes
}
