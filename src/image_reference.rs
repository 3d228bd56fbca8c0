use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

const CHINA_REGION_PREFIX: &str = "cn-";

// <account>.dkr.ecr.<region>.amazonaws.com[.cn]/<repository>:<tag>
static ECR_IMAGE_REGEX: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<account>\d+)\.dkr\.ecr\.(?P<region>[a-z]{2}(?:-[a-z]+)+-\d+)\.amazonaws\.com(?P<china>\.cn)?/(?P<repository>[^:@\s]+):(?P<tag>[^:@/\s]+)$",
    )
    .ok()
});

/// An image hosted in Amazon ECR, addressed by one of its tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EcrImageReference {
    pub account_id: String,
    pub region: String,
    pub repository: String,
    pub tag: String,
}

impl fmt::Display for EcrImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.dkr.ecr.{}.{}/{}:{}",
            self.account_id, self.region, self.dns_suffix(), self.repository, self.tag
        )
    }
}

impl EcrImageReference {
    /// Parses a container image string. Returns `None` for anything that is not a tagged
    /// ECR image (other registries, digest references, untagged images).
    pub fn parse(image: &str) -> Option<Self> {
        let captures = ECR_IMAGE_REGEX.as_ref()?.captures(image)?;
        // China regions only exist in the amazonaws.com.cn partition
        let in_china = captures["region"].starts_with(CHINA_REGION_PREFIX);
        if in_china != captures.name("china").is_some() {
            return None;
        }

        Some(Self {
            account_id: captures["account"].to_string(),
            region: captures["region"].to_string(),
            repository: captures["repository"].to_string(),
            tag: captures["tag"].to_string(),
        })
    }

    /// Registry host domain of the region's partition.
    pub fn dns_suffix(&self) -> &'static str {
        if self.region.starts_with(CHINA_REGION_PREFIX) {
            "amazonaws.com.cn"
        } else {
            "amazonaws.com"
        }
    }
}
