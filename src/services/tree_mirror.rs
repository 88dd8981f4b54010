//! Tree mirror: the published courseware tree as bidirectional indexes
//!
//! Each publish writes, for every node, its element row, then for every
//! child a forward append to the parent's child list followed by the
//! child's back-reference. The two edge writes are not atomic and the
//! append is not idempotent, so:
//!
//! - a retried publish may leave a child twice in a list; [`ChildSet`]
//!   collapses duplicates on read,
//! - a failed publish leaves a half-written snapshot that nobody sees,
//!   because the version chain row that makes it "latest" is written last.
//!
//! Each element row is also listed in a per-snapshot membership index, so
//! verification can check edges from both ends.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{EventBus, LedgerEvent};
use super::version_chain::{PinnedDeployment, VersionChain};
use crate::change_id::ChangeId;
use crate::db::tables::{SnapshotKey, SnapshotMemberKey, CHILDREN_BY_PARENT, ELEMENTS, ELEMENTS_BY_SNAPSHOT};
use crate::db::{Order, Repository};
use crate::error::StorageError;
use crate::migration::ParentIndex;
use crate::models::{ChildRef, DeployedActivity, Deployment, ElementType, LearnerElement, ParentRef, Walkable};

/// Authored node handed over by the publish pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoursewareNode {
    pub element_id: Uuid,
    pub element_type: ElementType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<CoursewareNode>,
}

impl CoursewareNode {
    pub fn new(element_id: Uuid, element_type: ElementType) -> Self {
        Self {
            element_id,
            element_type,
            config: None,
            theme: None,
            creator_id: None,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: CoursewareNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = Some(config.into());
        self
    }

    /// Number of nodes in this subtree
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(CoursewareNode::size).sum::<usize>()
    }

    fn to_element(&self, pin: PinnedDeployment) -> LearnerElement {
        LearnerElement {
            element_id: self.element_id,
            deployment_id: pin.deployment_id,
            change_id: pin.change_id,
            element_type: self.element_type,
            config: self.config.clone(),
            theme: self.theme.clone(),
            creator_id: self.creator_id,
        }
    }
}

/// A complete tree to freeze at `change_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub deployment_id: Uuid,
    pub cohort_id: Uuid,
    pub change_id: ChangeId,
    pub root: CoursewareNode,
}

impl PublishRequest {
    pub fn pin(&self) -> PinnedDeployment {
        PinnedDeployment::new(self.deployment_id, self.change_id)
    }
}

/// Ordered, de-duplicated children of one parent
///
/// Built from raw list cells, which may hold the same child more than once
/// after a redelivered append. The first occurrence fixes the position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildSet {
    children: Vec<ChildRef>,
}

impl ChildSet {
    pub fn from_cells(cells: impl IntoIterator<Item = ChildRef>) -> Self {
        let mut seen = HashSet::new();
        let children = cells
            .into_iter()
            .filter(|child| seen.insert(child.element_id))
            .collect();
        Self { children }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChildRef> {
        self.children.iter()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.children.iter().map(|c| c.element_id).collect()
    }

    /// Children that carry progress, in tree order
    pub fn progress_bearing(&self) -> Vec<ChildRef> {
        self.children
            .iter()
            .filter(|c| c.element_type.tracks_progress())
            .copied()
            .collect()
    }
}

impl IntoIterator for ChildSet {
    type Item = ChildRef;
    type IntoIter = std::vec::IntoIter<ChildRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.children.into_iter()
    }
}

impl<'a> IntoIterator for &'a ChildSet {
    type Item = &'a ChildRef;
    type IntoIter = std::slice::Iter<'a, ChildRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.children.iter()
    }
}

/// One edge pair found broken by [`TreeMirror::verify`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeFault {
    pub parent_id: Uuid,
    pub child_id: Uuid,
}

/// Consistency of a published snapshot's edges
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeReport {
    pub elements_checked: usize,
    /// Forward edge present, back-reference missing
    pub missing_back_refs: Vec<EdgeFault>,
    /// Back-reference names a parent other than the one listing the child
    pub mismatched_back_refs: Vec<EdgeFault>,
    /// Back-reference whose parent does not list the child
    pub orphan_back_refs: Vec<EdgeFault>,
    /// Listed children with no element row at this change
    pub missing_elements: Vec<Uuid>,
    /// Children listed more than once (redelivered appends)
    pub duplicate_cells: usize,
}

impl EdgeReport {
    pub fn is_clean(&self) -> bool {
        self.missing_back_refs.is_empty()
            && self.mismatched_back_refs.is_empty()
            && self.orphan_back_refs.is_empty()
            && self.missing_elements.is_empty()
    }
}

#[derive(Clone)]
pub struct TreeMirror {
    repo: Repository,
    parents: ParentIndex,
    chain: VersionChain,
    events: Arc<EventBus>,
}

impl TreeMirror {
    pub fn new(repo: Repository, parents: ParentIndex, chain: VersionChain, events: Arc<EventBus>) -> Self {
        Self {
            repo,
            parents,
            chain,
            events,
        }
    }

    pub fn versions(&self) -> &VersionChain {
        &self.chain
    }

    // =========================================================================
    // Publish
    // =========================================================================

    /// Freeze a courseware tree at the request's change id
    ///
    /// Safe to call again with the same request after a failure; the
    /// snapshot becomes latest only once every row is in place.
    pub async fn publish_tree(&self, request: &PublishRequest) -> Result<DeployedActivity, StorageError> {
        validate_tree(&request.root)?;
        let pin = request.pin();
        let deployed = DeployedActivity {
            deployment: Deployment {
                id: request.deployment_id,
                change_id: request.change_id,
                cohort_id: request.cohort_id,
            },
            activity_id: request.root.element_id,
        };

        info!(
            deployment_id = %pin.deployment_id,
            change_id = %pin.change_id,
            elements = request.root.size(),
            "Publishing courseware tree"
        );

        let written = async {
            self.write_snapshot(pin, &request.root).await?;
            self.chain.record(&deployed).await
        }
        .await;

        if let Err(e) = written {
            warn!(deployment_id = %pin.deployment_id, change_id = %pin.change_id, error = %e, "Publish incomplete");
            return Err(match e {
                StorageError::InvalidInput(_) | StorageError::PublishIncomplete { .. } => e,
                other => StorageError::PublishIncomplete {
                    deployment_id: pin.deployment_id,
                    change_id: pin.change_id,
                    reason: other.to_string(),
                },
            });
        }

        self.events.emit(LedgerEvent::DeploymentPublished {
            deployment_id: pin.deployment_id,
            change_id: pin.change_id,
            activity_id: deployed.activity_id,
            elements: request.root.size(),
        });
        Ok(deployed)
    }

    async fn write_snapshot(&self, pin: PinnedDeployment, root: &CoursewareNode) -> Result<(), StorageError> {
        let mut pending: VecDeque<&CoursewareNode> = VecDeque::from([root]);

        while let Some(node) = pending.pop_front() {
            let parent = self.put_element(pin, node).await?;
            for child in &node.children {
                self.add_child(&parent, child.element_id, child.element_type).await?;
            }
            for child in node.children.iter().rev() {
                pending.push_front(child);
            }
        }
        Ok(())
    }

    /// Write one element row and its snapshot membership (idempotent)
    pub async fn put_element(&self, pin: PinnedDeployment, node: &CoursewareNode) -> Result<LearnerElement, StorageError> {
        let element = node.to_element(pin);
        let key = SnapshotKey::new(element.element_id, pin.deployment_id, pin.change_id);
        self.repo.put(ELEMENTS, &key, &element).await?;

        let member = SnapshotMemberKey {
            deployment_id: pin.deployment_id,
            change_id: pin.change_id,
            element_id: element.element_id,
        };
        let entry = ChildRef {
            element_id: element.element_id,
            element_type: element.element_type,
        };
        self.repo.put(ELEMENTS_BY_SNAPSHOT, &member, &entry).await?;
        Ok(element)
    }

    /// Append a child to its parent's list, then write the back-reference
    ///
    /// The append is never retried by the storage layer. If it fails the
    /// caller retries the whole publish.
    pub async fn add_child(
        &self,
        parent: &LearnerElement,
        child_id: Uuid,
        child_type: ElementType,
    ) -> Result<(), StorageError> {
        if !parent.element_type.allowed_children().contains(&child_type) {
            return Err(StorageError::InvalidInput(format!(
                "{} {} cannot hold a {}",
                parent.element_type, parent.element_id, child_type
            )));
        }

        let key = SnapshotKey::new(parent.element_id, parent.deployment_id, parent.change_id);
        let cell = ChildRef {
            element_id: child_id,
            element_type: child_type,
        };
        self.repo.append(CHILDREN_BY_PARENT, &key, &cell).await?;

        let back_ref = ParentRef {
            parent_id: parent.element_id,
            parent_type: parent.element_type,
            child_id,
            child_type,
        };
        self.parents
            .write(parent.deployment_id, parent.change_id, &back_ref)
            .await
    }

    // =========================================================================
    // Pinned reads
    // =========================================================================

    pub async fn find_element(&self, pin: PinnedDeployment, element_id: Uuid) -> Result<Option<LearnerElement>, StorageError> {
        self.repo
            .get(ELEMENTS, &SnapshotKey::new(element_id, pin.deployment_id, pin.change_id))
            .await
    }

    /// Element as a walkable, if it is one
    pub async fn find_walkable(&self, pin: PinnedDeployment, element_id: Uuid) -> Result<Option<Walkable>, StorageError> {
        Ok(self
            .find_element(pin, element_id)
            .await?
            .and_then(Walkable::from_element))
    }

    pub async fn find_children(&self, pin: PinnedDeployment, parent_id: Uuid) -> Result<ChildSet, StorageError> {
        let key = SnapshotKey::new(parent_id, pin.deployment_id, pin.change_id);
        let cells = self.repo.cells(CHILDREN_BY_PARENT, &key).await?;
        Ok(ChildSet::from_cells(cells))
    }

    pub async fn find_parent(
        &self,
        pin: PinnedDeployment,
        child_id: Uuid,
        child_type: Option<ElementType>,
    ) -> Result<Option<ParentRef>, StorageError> {
        self.parents
            .read(child_id, child_type, pin.deployment_id, pin.change_id)
            .await
    }

    /// Back-references from an element up to the root, nearest first
    pub async fn ancestry(&self, pin: PinnedDeployment, element_id: Uuid) -> Result<Vec<ParentRef>, StorageError> {
        let mut chain = Vec::new();
        let mut visited = HashSet::from([element_id]);
        let mut current = element_id;

        while let Some(edge) = self.find_parent(pin, current, None).await? {
            if !visited.insert(edge.parent_id) {
                return Err(StorageError::Internal(format!(
                    "cycle in published tree {} at element {}",
                    pin, edge.parent_id
                )));
            }
            current = edge.parent_id;
            chain.push(edge);
        }
        Ok(chain)
    }

    /// Edge to the nearest walkable above an element, skipping pathways
    pub async fn enclosing_walkable(
        &self,
        pin: PinnedDeployment,
        element_id: Uuid,
    ) -> Result<Option<ParentRef>, StorageError> {
        Ok(self
            .ancestry(pin, element_id)
            .await?
            .into_iter()
            .find(|edge| edge.parent_type.is_walkable()))
    }

    // =========================================================================
    // Latest reads (pin once, then read the pinned snapshot)
    // =========================================================================

    pub async fn find_latest_element(
        &self,
        deployment_id: Uuid,
        element_id: Uuid,
    ) -> Result<Option<LearnerElement>, StorageError> {
        match self.chain.pin(deployment_id).await? {
            Some(pin) => self.find_element(pin, element_id).await,
            None => Ok(None),
        }
    }

    pub async fn find_latest_children(&self, deployment_id: Uuid, parent_id: Uuid) -> Result<ChildSet, StorageError> {
        match self.chain.pin(deployment_id).await? {
            Some(pin) => self.find_children(pin, parent_id).await,
            None => Ok(ChildSet::default()),
        }
    }

    pub async fn find_latest_parent(&self, deployment_id: Uuid, child_id: Uuid) -> Result<Option<ParentRef>, StorageError> {
        match self.chain.pin(deployment_id).await? {
            Some(pin) => self.find_parent(pin, child_id, None).await,
            None => Ok(None),
        }
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Every element stored for a snapshot, in element id order
    pub async fn snapshot_members(&self, pin: PinnedDeployment) -> Result<Vec<ChildRef>, StorageError> {
        self.repo
            .scan(
                ELEMENTS_BY_SNAPSHOT,
                SnapshotMemberKey::partition(&pin.deployment_id, &pin.change_id),
                Order::Asc,
                None,
            )
            .await
    }

    /// Check every edge pair of the subtree at `root_id` from both ends
    ///
    /// The forward walk follows child lists down from the root. The reverse
    /// pass reads the back-reference of every snapshot member touching the
    /// subtree and checks that the named parent lists it.
    pub async fn verify(&self, pin: PinnedDeployment, root_id: Uuid) -> Result<EdgeReport, StorageError> {
        let mut report = EdgeReport::default();
        let mut visited = HashSet::from([root_id]);
        let mut pending = VecDeque::from([root_id]);
        let mut lists: HashMap<Uuid, ChildSet> = HashMap::new();

        while let Some(parent_id) = pending.pop_front() {
            report.elements_checked += 1;
            let key = SnapshotKey::new(parent_id, pin.deployment_id, pin.change_id);
            let cells = self.repo.cells(CHILDREN_BY_PARENT, &key).await?;
            let raw = cells.len();
            let children = ChildSet::from_cells(cells);
            report.duplicate_cells += raw - children.len();

            for child in &children {
                let fault = EdgeFault {
                    parent_id,
                    child_id: child.element_id,
                };
                match self.find_parent(pin, child.element_id, Some(child.element_type)).await? {
                    None => report.missing_back_refs.push(fault),
                    Some(edge) if edge.parent_id != parent_id => report.mismatched_back_refs.push(fault),
                    Some(_) => {}
                }
                if self.find_element(pin, child.element_id).await?.is_none() {
                    report.missing_elements.push(child.element_id);
                }
                if visited.insert(child.element_id) {
                    pending.push_back(child.element_id);
                }
            }
            lists.insert(parent_id, children);
        }

        let mismatched: HashSet<Uuid> = report.mismatched_back_refs.iter().map(|f| f.child_id).collect();
        for member in self.snapshot_members(pin).await? {
            let Some(edge) = self.find_parent(pin, member.element_id, Some(member.element_type)).await? else {
                continue;
            };
            let touches_subtree = visited.contains(&edge.parent_id) || visited.contains(&member.element_id);
            if !touches_subtree || mismatched.contains(&member.element_id) {
                continue;
            }
            let listed = match lists.get(&edge.parent_id) {
                Some(children) => children.iter().any(|c| c.element_id == member.element_id),
                None => self
                    .find_children(pin, edge.parent_id)
                    .await?
                    .iter()
                    .any(|c| c.element_id == member.element_id),
            };
            if !listed {
                report.orphan_back_refs.push(EdgeFault {
                    parent_id: edge.parent_id,
                    child_id: member.element_id,
                });
            }
        }

        debug!(
            pin = %pin,
            checked = report.elements_checked,
            clean = report.is_clean(),
            "Verified snapshot edges"
        );
        Ok(report)
    }
}

/// Reject trees the mirror cannot represent
fn validate_tree(root: &CoursewareNode) -> Result<(), StorageError> {
    if root.element_type != ElementType::Activity {
        return Err(StorageError::InvalidInput(format!(
            "tree root {} must be an ACTIVITY, got {}",
            root.element_id, root.element_type
        )));
    }

    let mut seen = HashSet::new();
    let mut pending = vec![root];
    while let Some(node) = pending.pop() {
        if !seen.insert(node.element_id) {
            return Err(StorageError::InvalidInput(format!(
                "element {} appears more than once in the tree",
                node.element_id
            )));
        }
        for child in &node.children {
            if !node.element_type.allowed_children().contains(&child.element_type) {
                return Err(StorageError::InvalidInput(format!(
                    "{} {} cannot hold a {}",
                    node.element_type, node.element_id, child.element_type
                )));
            }
            pending.push(child);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consistency::{Consistency, Table};
    use crate::db::{MemoryStore, TenantContext};
    use crate::migration::MigrationPhase;

    struct Fixture {
        store: Arc<MemoryStore>,
        mirror: TreeMirror,
        chain: VersionChain,
    }

    fn fixture() -> Fixture {
        fixture_in(MigrationPhase::DualWrite)
    }

    fn fixture_in(phase: MigrationPhase) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let repo = Repository::new(store.clone(), TenantContext::default(), Consistency::Quorum);
        let chain = VersionChain::new(repo.clone());
        let parents = ParentIndex::new(repo.clone(), phase);
        let mirror = TreeMirror::new(repo, parents, chain.clone(), Arc::new(EventBus::new()));
        Fixture { store, mirror, chain }
    }

    fn node(element_type: ElementType) -> CoursewareNode {
        CoursewareNode::new(Uuid::new_v4(), element_type)
    }

    fn request(root: CoursewareNode) -> PublishRequest {
        PublishRequest {
            deployment_id: Uuid::new_v4(),
            cohort_id: Uuid::new_v4(),
            change_id: ChangeId::new(),
            root,
        }
    }

    #[test]
    fn test_child_set_dedups_keeping_first_position() {
        let a = ChildRef {
            element_id: Uuid::new_v4(),
            element_type: ElementType::Interactive,
        };
        let b = ChildRef {
            element_id: Uuid::new_v4(),
            element_type: ElementType::Component,
        };
        let set = ChildSet::from_cells([a, b, a, a]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.ids(), vec![a.element_id, b.element_id]);
        assert_eq!(set.progress_bearing(), vec![a]);
    }

    #[test]
    fn test_validate_rejects_bad_trees() {
        let pathway_root = node(ElementType::Pathway);
        assert!(validate_tree(&pathway_root).is_err());

        let feedback_under_activity = node(ElementType::Activity).with_child(node(ElementType::Feedback));
        assert!(validate_tree(&feedback_under_activity).is_err());

        let shared = node(ElementType::Interactive);
        let duplicated = node(ElementType::Activity).with_child(
            node(ElementType::Pathway)
                .with_child(shared.clone())
                .with_child(shared),
        );
        assert!(validate_tree(&duplicated).is_err());
    }

    #[tokio::test]
    async fn test_publish_writes_edges_then_version_last() {
        let f = fixture();
        let interactive = node(ElementType::Interactive).with_child(node(ElementType::Feedback));
        let pathway = node(ElementType::Pathway).with_child(interactive.clone());
        let activity = node(ElementType::Activity)
            .with_child(pathway.clone())
            .with_child(node(ElementType::Component));
        let request = request(activity.clone());

        f.mirror.publish_tree(&request).await.unwrap();

        let log = f.store.statement_log();
        assert_eq!(log.last().map(|r| r.table), Some(Table::Deployment));
        assert_eq!(log.first().map(|r| r.table), Some(Table::Element));

        let pin = request.pin();
        let children = f.mirror.find_children(pin, activity.element_id).await.unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children.ids()[0], pathway.element_id);

        let ancestry = f.mirror.ancestry(pin, interactive.element_id).await.unwrap();
        let ids: Vec<Uuid> = ancestry.iter().map(|e| e.parent_id).collect();
        assert_eq!(ids, vec![pathway.element_id, activity.element_id]);

        let walkable = f.mirror.find_walkable(pin, interactive.element_id).await.unwrap().unwrap();
        assert_eq!(walkable.element_type(), ElementType::Interactive);

        let report = f.mirror.verify(pin, activity.element_id).await.unwrap();
        assert!(report.is_clean(), "{:?}", report);
        assert_eq!(report.elements_checked, request.root.size());
    }

    #[tokio::test]
    async fn test_failed_publish_is_not_latest() {
        let f = fixture();
        let request = request(node(ElementType::Activity).with_child(node(ElementType::Pathway)));
        f.store.fail_table(Table::ChildrenByParent, 1);

        let err = f.mirror.publish_tree(&request).await.unwrap_err();
        assert!(matches!(err, StorageError::PublishIncomplete { .. }));
        assert!(f.chain.latest_change_id(request.deployment_id).await.unwrap().is_none());

        f.mirror.publish_tree(&request).await.unwrap();
        assert_eq!(
            f.chain.latest_change_id(request.deployment_id).await.unwrap(),
            Some(request.change_id)
        );
    }

    #[tokio::test]
    async fn test_verify_reports_child_without_back_ref() {
        let f = fixture_in(MigrationPhase::UnifiedOnly);
        let pathway = node(ElementType::Pathway).with_child(node(ElementType::Interactive));
        let request = request(node(ElementType::Activity).with_child(pathway.clone()));
        f.store.fail_table(Table::ParentByChild, 1);

        let err = f.mirror.publish_tree(&request).await.unwrap_err();
        assert!(matches!(err, StorageError::PublishIncomplete { .. }));

        let report = f.mirror.verify(request.pin(), request.root.element_id).await.unwrap();
        assert!(!report.is_clean());
        assert_eq!(
            report.missing_back_refs,
            vec![EdgeFault {
                parent_id: request.root.element_id,
                child_id: pathway.element_id,
            }]
        );
    }

    #[tokio::test]
    async fn test_verify_reports_back_ref_the_parent_does_not_list() {
        let f = fixture();
        let interactive = node(ElementType::Interactive);
        let pathway = node(ElementType::Pathway).with_child(interactive.clone());
        let request = request(node(ElementType::Activity).with_child(pathway.clone()));
        f.mirror.publish_tree(&request).await.unwrap();

        let pin = request.pin();
        assert_eq!(f.mirror.snapshot_members(pin).await.unwrap().len(), request.root.size());
        assert!(f.mirror.verify(pin, request.root.element_id).await.unwrap().is_clean());

        // The root claims the pathway as its parent; the pathway never listed it
        let stray = ParentRef {
            parent_id: pathway.element_id,
            parent_type: ElementType::Pathway,
            child_id: request.root.element_id,
            child_type: ElementType::Activity,
        };
        f.mirror
            .parents
            .write(pin.deployment_id, pin.change_id, &stray)
            .await
            .unwrap();

        let report = f.mirror.verify(pin, request.root.element_id).await.unwrap();
        assert!(!report.is_clean());
        assert!(report.missing_back_refs.is_empty());
        assert!(report.mismatched_back_refs.is_empty());
        assert_eq!(
            report.orphan_back_refs,
            vec![EdgeFault {
                parent_id: pathway.element_id,
                child_id: request.root.element_id,
            }]
        );
    }

    #[tokio::test]
    async fn test_retried_publish_does_not_duplicate_children() {
        let f = fixture();
        let pathway = node(ElementType::Pathway);
        let request = request(node(ElementType::Activity).with_child(pathway.clone()));

        f.mirror.publish_tree(&request).await.unwrap();
        f.mirror.publish_tree(&request).await.unwrap();

        let children = f
            .mirror
            .find_latest_children(request.deployment_id, request.root.element_id)
            .await
            .unwrap();
        assert_eq!(children.ids(), vec![pathway.element_id]);

        let report = f.mirror.verify(request.pin(), request.root.element_id).await.unwrap();
        assert_eq!(report.duplicate_cells, 1);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_latest_reads_follow_republish() {
        let f = fixture();
        let deployment_id = Uuid::new_v4();
        let root = node(ElementType::Activity).with_config("v1");
        let first = PublishRequest {
            deployment_id,
            cohort_id: Uuid::nil(),
            change_id: ChangeId::from_unix(1_700_000_000, 0, 0),
            root: root.clone(),
        };
        let second = PublishRequest {
            change_id: ChangeId::from_unix(1_700_000_500, 0, 0),
            root: root.clone().with_config("v2"),
            ..first.clone()
        };

        f.mirror.publish_tree(&second).await.unwrap();
        f.mirror.publish_tree(&first).await.unwrap();

        let latest = f
            .mirror
            .find_latest_element(deployment_id, root.element_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.config.as_deref(), Some("v2"));

        // The older snapshot stays readable
        let old = f.mirror.find_element(first.pin(), root.element_id).await.unwrap().unwrap();
        assert_eq!(old.config.as_deref(), Some("v1"));
    }
}
