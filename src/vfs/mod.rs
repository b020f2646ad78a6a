//! The virtual filesystem: a lazily-populated view of the course platform
//!
//! [`Vfs`] owns the tree root and the one-shot edit overlay. Opening a
//! path resolves POSIX-style components against directory children,
//! fetching each directory from the remote source the first time it is
//! touched. Immediately before the very first resolution, the pending
//! edit plan is applied (course additions, then deletions) and
//! discarded.

pub(crate) mod catalog;
pub mod files;
pub mod node;

pub use node::{DuplicatePolicy, Node, NodeKind, NodeRef, Readiness};

use crate::config::{EditPlan, Labels};
use crate::datasource::SourceRef;
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::rc::Rc;

/// The browsable namespace over one platform session
pub struct Vfs {
    root: NodeRef,
    source: SourceRef,
    labels: Rc<Labels>,
    edit: RefCell<Option<EditPlan>>,
}

impl Vfs {
    /// Build the tree over `source`, with a pending edit plan that will
    /// be applied before the first resolution.
    pub fn new(source: SourceRef, labels: Labels, edit: EditPlan) -> Result<Self> {
        let labels = Rc::new(labels);
        let root = catalog::root(&source, &labels)?;
        Ok(Vfs {
            root,
            source,
            labels,
            edit: RefCell::new(Some(edit)),
        })
    }

    /// The tree root
    pub fn root(&self) -> NodeRef {
        self.root.clone()
    }

    /// The namespace labels the tree was built with
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Resolve an absolute path from the root and force the final node
    /// ready.
    pub fn open(&self, path: &str) -> Result<NodeRef> {
        self.apply_pending_edits()?;
        node::resolve_at(&self.root, path, 0)
    }

    /// Resolve a path relative to `cwd` (absolute paths restart from the
    /// root).
    pub fn open_at(&self, path: &str, cwd: &NodeRef) -> Result<NodeRef> {
        self.apply_pending_edits()?;
        node::resolve_at(cwd, path, 0)
    }

    /// Apply the edit overlay exactly once: additions first, then
    /// deletions. Internal resolutions here bypass the overlay check,
    /// so overlay application cannot re-enter itself.
    fn apply_pending_edits(&self) -> Result<()> {
        let Some(plan) = self.edit.borrow_mut().take() else {
            return Ok(());
        };
        if plan.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            additions = plan.add_courses.len(),
            deletions = plan.delete_paths.len(),
            "applying edit overlay"
        );

        for addition in &plan.add_courses {
            let semester_path = format!("/{}/{}", self.labels.dir_courses, addition.semester);
            let semester_dir = node::resolve_at(&self.root, &semester_path, 0)?;
            let manual = catalog::manual_course(
                &semester_dir,
                &self.source,
                &self.labels,
                &addition.semester,
                &addition.course_sn,
            );
            Node::fetch(&manual.node)?;
            let name = manual
                .discovered_name
                .borrow()
                .clone()
                .ok_or_else(|| Error::malformed("info page carried no course name"))?;
            tracing::info!(course_sn = %addition.course_sn, name = %name, "spliced in course");
            // Reachable both by display name and by external id.
            semester_dir.add(&name, manual.node, DuplicatePolicy::Reject)?;
            semester_dir.add(
                &addition.course_sn,
                Node::new_internal_link(&semester_dir, name),
                DuplicatePolicy::Reject,
            )?;
        }

        for path in &plan.delete_paths {
            let target = node::resolve_at(&self.root, path, 0)?;
            if target.is_root() {
                return Err(Error::invalid_op("refusing to delete the tree root"));
            }
            let Some(name) = path.rsplit('/').find(|component| !component.is_empty()) else {
                return Err(Error::invalid_op("refusing to delete the tree root"));
            };
            let parent = target.parent()?;
            parent.unlink(name)?;
            tracing::info!(path = %path, "removed from the tree");
        }
        Ok(())
    }
}

/// Join one child name onto a POSIX-style virtual path
pub(crate) fn join_vfs_path(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CourseAddition;
    use crate::test_support::{as_source, read_node, FakeDataSource};
    use serde_json::{json, Value};
    use std::rc::Rc;

    fn semester_listing() -> Value {
        json!({"semester": [
            {"semester": "112-1", "now": 1},
            {"semester": "111-2"}
        ]})
    }

    fn semester_112_1() -> Value {
        json!({
            "student_id": "b01234567",
            "student_cname": "Student",
            "semester": "112-1",
            "calendar": [
                {"crs_cname": "Algorithms", "course_sn": "1001", "day": 2, "slot": "789"}
            ],
            "grid": [
                {"class_no": 0, "course_sn": 0, "crs_cname": "Calendar", "semester": "112-1"},
                {"class_no": "01", "course_sn": "1001", "crs_cname": "Algorithms", "semester": "112-1"}
            ]
        })
    }

    fn course_1001() -> Value {
        json!({
            "lang": "eng",
            "course_info": {
                "dpt_cou": "CSIE1001",
                "place": "R103",
                "mark": "",
                "course_req": [
                    {"item": "Final", "percent": "60", "notes": "closed book\nno laptops"}
                ]
            },
            "teacher_info": {},
            "contents": [
                {"syl_sn": "77", "unit": "Week 1", "notes": "2023-09-04", "subject": "Intro"}
            ],
            "content_files": [
                {"syl_sn": "77", "file_name": "intro.pdf"}
            ],
            "bulletin": [
                {"sn": "5", "subject": "Welcome", "post_time": "2023-09-01 10:00",
                 "b_link": "", "attach": "syllabus.pdf", "content": "see attachment"}
            ]
        })
    }

    fn course_fixture() -> FakeDataSource {
        FakeDataSource::new()
            .with_api(&[("mode", "semester")], semester_listing())
            .with_api(&[("mode", "semester"), ("semester", "112-1")], semester_112_1())
            .with_api(
                &[
                    ("mode", "course"),
                    ("semester", "112-1"),
                    ("course_sn", "1001"),
                    ("class_no", "01"),
                ],
                course_1001(),
            )
    }

    fn vfs_with(fake: FakeDataSource, edit: EditPlan) -> Vfs {
        let source = fake.into_source();
        Vfs::new(as_source(&source), Labels::default(), edit).unwrap()
    }

    #[test]
    fn semesters_appear_with_a_current_link() {
        let vfs = vfs_with(course_fixture(), EditPlan::default());
        let courses = vfs.open("/courses").unwrap();
        let names: Vec<String> = Node::list(&courses)
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, ["current", "112-1", "111-2"]);

        // The alias dereferences to the active semester on access.
        let link = vfs.open("/courses/current").unwrap();
        assert!(link.is_internal_link());
        let via_link = Node::access(&link, ".").unwrap();
        let direct = vfs.open("/courses/112-1").unwrap();
        assert!(Rc::ptr_eq(&via_link, &direct));
    }

    #[test]
    fn dot_and_dotdot_of_resolved_directories() {
        let vfs = vfs_with(course_fixture(), EditPlan::default());
        let semester = vfs.open("/courses/112-1").unwrap();
        let same = Node::access(&semester, ".").unwrap();
        assert!(Rc::ptr_eq(&same, &semester));
        let up = Node::access(&semester, "..").unwrap();
        let courses = vfs.open("/courses").unwrap();
        assert!(Rc::ptr_eq(&up, &courses));
    }

    #[test]
    fn course_is_reachable_by_name_and_by_id() {
        let vfs = vfs_with(course_fixture(), EditPlan::default());
        let by_name = vfs.open("/courses/112-1/Algorithms/course.json").unwrap();
        let by_id = vfs.open("/courses/112-1/1001/course.json").unwrap();
        assert!(Rc::ptr_eq(&by_name, &by_id));
    }

    #[test]
    fn course_metadata_carries_values_and_provenance() {
        let vfs = vfs_with(course_fixture(), EditPlan::default());
        let metadata = vfs.open("/courses/112-1/Algorithms/course.json").unwrap();
        let doc: Value = serde_json::from_slice(&read_node(&metadata)).unwrap();

        assert_eq!(doc[0]["name"], "Algorithms");
        assert_eq!(doc[0]["serial"], "1001");
        assert_eq!(doc[0]["language"], "English");
        assert_eq!(doc[0]["course code"], "CSIE1001");
        assert_eq!(doc[0]["place"], "R103");
        assert_eq!(doc[0]["time"], json!([["Wed", "789"]]));
        // Multi-line evaluation notes are flattened with the marker.
        assert_eq!(
            doc[0]["evaluation"][0]["notes"],
            json!(["(multi-line string)", "closed book", "no laptops"])
        );
        assert_eq!(doc[1]["name"], "crs_cname");
        assert_eq!(doc[1]["language"], "lang");
    }

    #[test]
    fn contents_and_announcements_expose_remote_files() {
        let fake = course_fixture()
            .with_file("/course/1001/content/intro.pdf", b"pdf bytes")
            .with_file("/course/1001/bulletin/syllabus.pdf", b"syllabus");
        let vfs = vfs_with(fake, EditPlan::default());

        let record = vfs
            .open("/courses/112-1/Algorithms/contents/00000077 Week 1.json")
            .unwrap();
        let doc: Value = serde_json::from_slice(&read_node(&record)).unwrap();
        assert_eq!(doc[0]["files"], json!(["intro.pdf"]));

        let file = vfs
            .open("/courses/112-1/Algorithms/contents/files/intro.pdf")
            .unwrap();
        assert!(!file.is_local(), "remote files are streamed, not resident");
        assert_eq!(read_node(&file), b"pdf bytes");
        assert_eq!(Node::size(&file).unwrap(), 9);

        let attachment = vfs
            .open("/courses/112-1/Algorithms/announcements/attachments/syllabus.pdf")
            .unwrap();
        assert_eq!(read_node(&attachment), b"syllabus");
    }

    #[test]
    fn fetch_is_lazy_and_happens_once() {
        let fake = course_fixture();
        let source = fake.into_source();
        let vfs = Vfs::new(as_source(&source), Labels::default(), EditPlan::default()).unwrap();
        assert!(source.borrow().api_log.is_empty(), "construction fetches nothing");

        vfs.open("/courses/112-1").unwrap();
        let after_semester = source.borrow().api_log.len();
        vfs.open("/courses/112-1").unwrap();
        assert_eq!(
            source.borrow().api_log.len(),
            after_semester,
            "a second open re-fetches nothing"
        );
    }

    const INFO_PAGE: &str = r#"<div id="sect_cont"><table>
        <tr><th>Course Name</th><td>Special Topics</td></tr>
        <tr><th>Semester</th><td>112-1</td></tr>
        <tr><th>Teacher</th><td>Prof. X</td></tr>
        <tr><th>Course No.</th><td>CSIE5999</td></tr>
        <tr><th>Class</th><td>01</td></tr>
        <tr><th>Time</th><td>Fri 234</td></tr>
        <tr><th>Classroom</th><td>R442</td></tr>
    </table></div>"#;

    fn overlay_fixture() -> FakeDataSource {
        course_fixture()
            .with_page("/modules/index.php", "<html><body>frame</body></html>")
            .with_page("/modules/info/info.php", INFO_PAGE)
            // No table on the homework page: the function is disabled.
            .with_page("/modules/hw/hw.php", "<html><body><p>closed</p></body></html>")
    }

    #[test]
    fn edit_overlay_applies_once_before_first_resolution() {
        let edit = EditPlan {
            add_courses: vec![CourseAddition {
                semester: "112-1".to_string(),
                course_sn: "9999".to_string(),
            }],
            delete_paths: vec!["/courses/112-1/Algorithms".to_string()],
        };
        let vfs = vfs_with(overlay_fixture(), edit);

        // The spliced-in course resolves by discovered name and by id.
        let by_name = vfs.open("/courses/112-1/Special Topics").unwrap();
        let metadata = Node::access(&by_name, "course.json").unwrap();
        let doc: Value = serde_json::from_slice(&read_node(&metadata)).unwrap();
        assert_eq!(doc[0]["name"], "Special Topics");
        assert_eq!(doc[0]["serial"], "9999");
        assert_eq!(doc[1]["name"], "/modules/info/info.php");
        assert_eq!(doc[1]["serial"], "configuration");

        let by_id = vfs.open("/courses/112-1/9999").unwrap();
        assert!(by_id.is_internal_link());
        let via_id = Node::access(&by_id, "course.json").unwrap();
        assert!(Rc::ptr_eq(&via_id, &metadata));

        // The deleted course is gone, and stays gone on later opens
        // without the overlay erroring a second time.
        assert!(matches!(
            vfs.open("/courses/112-1/Algorithms"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            vfs.open("/courses/112-1/Algorithms"),
            Err(Error::NotFound(_))
        ));
        assert!(vfs.open("/courses/112-1/Special Topics").is_ok());
    }

    #[test]
    fn deleting_the_root_is_fatal() {
        let edit = EditPlan {
            add_courses: Vec::new(),
            delete_paths: vec!["/".to_string()],
        };
        let vfs = vfs_with(course_fixture(), edit);
        assert!(matches!(
            vfs.open("/courses"),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn empty_components_are_ignored() {
        let vfs = vfs_with(course_fixture(), EditPlan::default());
        let a = vfs.open("/courses//112-1/").unwrap();
        let b = vfs.open("/courses/112-1").unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }
}
