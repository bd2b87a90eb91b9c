use std::fmt;

use kube::core::GroupVersionKind;

/// Identifies a resource type by its API group, version and kind.
///
/// The core group is the empty string.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResourceIdentity {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceIdentity {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Returns the identity of the statically typed resource `K`.
    pub fn of<K>() -> Self
    where
        K: kube::Resource<DynamicType = ()>,
    {
        Self::new(K::group(&()), K::version(&()), K::kind(&()))
    }

    pub fn is_core_group(&self) -> bool {
        self.group.is_empty()
    }

    /// The `apiVersion` of objects of this type, for example `v1` or `apps/v1`.
    pub fn api_version(&self) -> String {
        if self.is_core_group() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// The `kind` of an admission request identifies the type of its object.
impl From<&GroupVersionKind> for ResourceIdentity {
    fn from(gvk: &GroupVersionKind) -> Self {
        Self::new(&gvk.group, &gvk.version, &gvk.kind)
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}
