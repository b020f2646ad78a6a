//! Course-platform providers for the virtual filesystem
//!
//! Each directory kind in the course subtree gets a [`Populate`]
//! implementation that turns one structured-API response (or, for
//! manually-added courses, one scraped page) into children. Population
//! is lazy: nothing here runs until a path resolution first touches the
//! directory.
//!
//! Remote layout recap: `mode=semester` lists semesters, the same call
//! with a `semester` argument yields that semester's calendar and course
//! grid, and `mode=course` yields one course's metadata plus embedded
//! announcement/content/homework/grade payloads. File downloads live
//! under `/course/<sn>/<section>/<name>`.

use crate::config::Labels;
use crate::datasource::{Reuse, SourceRef};
use crate::error::{Error, Result};
use crate::vfs::files::{self, fold_multiline, RecordFile, TableFile};
use crate::vfs::node::{DuplicatePolicy, Node, NodeRef, Populate};
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Map, Value};
use std::cell::RefCell;
use std::rc::Rc;

const DAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Shared handles every populator carries
#[derive(Clone)]
pub(crate) struct Catalog {
    source: SourceRef,
    labels: Rc<Labels>,
}

impl Catalog {
    fn api(&self, fields: &[(&str, &str)], reuse: Reuse) -> Result<Option<Value>> {
        let fields: Vec<(String, String)> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.source.borrow_mut().api(&fields, reuse)
    }

    fn api_fresh(&self, fields: &[(&str, &str)]) -> Result<Value> {
        self.api(fields, Reuse::Fresh)?
            .ok_or_else(|| Error::invalid_op("fresh API call returned no data"))
    }

    fn web_fresh(&self, path: &str, args: &[(&str, &str)]) -> Result<Html> {
        let args: Vec<(String, String)> = args
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.source
            .borrow_mut()
            .web_page(path, &args, Reuse::Fresh)?
            .ok_or_else(|| Error::invalid_op("fresh page request returned no data"))
    }

    /// Whether a per-course platform function answers with real content,
    /// checked before scraping it.
    fn function_enabled(&self, course_sn: &str, function: &str, path: &str) -> Result<bool> {
        self.web_fresh(
            "/modules/index.php",
            &[("csn", course_sn), ("default_fun", function)],
        )?;
        let page = self.web_fresh(path, &[])?;
        Ok(page.select(&selector("table")?).next().is_some())
    }
}

/// Build the tree root: the reserved category directories, with the
/// course subtree wired to the structured API.
pub(crate) fn root(source: &SourceRef, labels: &Rc<Labels>) -> Result<NodeRef> {
    let ctx = Catalog {
        source: source.clone(),
        labels: labels.clone(),
    };
    let root = Node::new_root();
    let courses = Node::new_lazy_dir(&root, Box::new(CoursesPopulator { ctx: ctx.clone() }));
    root.add(&labels.dir_courses, courses, DuplicatePolicy::Reject)?;
    for name in [&labels.dir_students, &labels.dir_teachers] {
        let dir = Node::new_plain_dir(&root);
        dir.mark_ready()?;
        root.add(name, dir, DuplicatePolicy::Reject)?;
    }
    root.mark_ready()?;
    Ok(root)
}

/// A manually-added course spliced in by the edit overlay, plus the slot
/// its display name lands in once fetched.
pub(crate) struct ManualCourse {
    /// The pending course directory
    pub node: NodeRef,
    /// Display name discovered from the platform info page during fetch
    pub discovered_name: Rc<RefCell<Option<String>>>,
}

/// Create the course directory for an edit-overlay addition under
/// `parent` (the semester directory). The caller fetches it eagerly and
/// registers it under the discovered name.
pub(crate) fn manual_course(
    parent: &NodeRef,
    source: &SourceRef,
    labels: &Rc<Labels>,
    semester: &str,
    course_sn: &str,
) -> ManualCourse {
    let discovered_name = Rc::new(RefCell::new(None));
    let node = Node::new_lazy_dir(
        parent,
        Box::new(ManualCoursePopulator {
            ctx: Catalog {
                source: source.clone(),
                labels: labels.clone(),
            },
            semester: semester.to_string(),
            course_sn: course_sn.to_string(),
            discovered_name: discovered_name.clone(),
        }),
    );
    ManualCourse {
        node,
        discovered_name,
    }
}

// ---------------------------------------------------------------------
// Course subtree from the structured API
// ---------------------------------------------------------------------

struct CoursesPopulator {
    ctx: Catalog,
}

impl Populate for CoursesPopulator {
    fn populate(&self, dir: &NodeRef) -> Result<()> {
        let labels = &self.ctx.labels;
        let result = self.ctx.api_fresh(&[("mode", "semester")])?;
        for semester in arr_field(&result, "semester")? {
            let name = str_field(semester, "semester")?;
            if semester.get("now").is_some() {
                dir.add(
                    &labels.link_current_semester,
                    Node::new_internal_link(dir, name),
                    DuplicatePolicy::Reject,
                )?;
            }
            let node = Node::new_lazy_dir(
                dir,
                Box::new(SemesterPopulator {
                    ctx: self.ctx.clone(),
                    semester: name.to_string(),
                }),
            );
            dir.add(name, node, DuplicatePolicy::Reject)?;
        }
        Ok(())
    }
}

struct SemesterPopulator {
    ctx: Catalog,
    semester: String,
}

#[derive(Default, Clone)]
struct CourseSeed {
    sn: String,
    times: Vec<(u64, String)>,
    class_no: String,
}

impl Populate for SemesterPopulator {
    fn populate(&self, dir: &NodeRef) -> Result<()> {
        let result = self
            .ctx
            .api_fresh(&[("mode", "semester"), ("semester", &self.semester)])?;

        // Merge the weekly calendar and the course grid into one seed
        // per display name, preserving first-appearance order.
        let mut seeds: Vec<(String, CourseSeed)> = Vec::new();

        for course in arr_field(&result, "calendar")? {
            let name = str_field(course, "crs_cname")?;
            let sn = str_field(course, "course_sn")?;
            let day = field(course, "day")?
                .as_u64()
                .ok_or_else(|| Error::malformed("calendar day is not a number"))?;
            let slot = str_field(course, "slot")?;
            let seed = seed_mut(&mut seeds, name);
            seed.sn = sn.to_string();
            seed.times.push((day, slot.to_string()));
        }

        for course in arr_field(&result, "grid")? {
            // The grid lists the calendar itself as a zeroed pseudo-entry.
            if course.get("class_no") == Some(&json!(0))
                && course.get("course_sn") == Some(&json!(0))
                && course.get("crs_cname") == Some(&json!("Calendar"))
            {
                continue;
            }
            let name = str_field(course, "crs_cname")?;
            let sn = str_field(course, "course_sn")?;
            let class_no = str_field(course, "class_no")?;
            let seed = seed_mut(&mut seeds, name);
            seed.sn = sn.to_string();
            seed.class_no = class_no.to_string();
        }

        for (name, seed) in &seeds {
            let node = Node::new_lazy_dir(
                dir,
                Box::new(CoursePopulator {
                    ctx: self.ctx.clone(),
                    semester: self.semester.clone(),
                    name: name.clone(),
                    seed: seed.clone(),
                }),
            );
            dir.add(name, node, DuplicatePolicy::Reject)?;
        }

        // Course ids double as lookup keys, pointing at the display name.
        for (name, seed) in &seeds {
            if !seed.sn.is_empty() {
                dir.add(
                    &seed.sn,
                    Node::new_internal_link(dir, name.clone()),
                    DuplicatePolicy::Reject,
                )?;
            }
        }
        Ok(())
    }
}

fn seed_mut<'a>(seeds: &'a mut Vec<(String, CourseSeed)>, name: &str) -> &'a mut CourseSeed {
    if let Some(index) = seeds.iter().position(|(existing, _)| existing == name) {
        &mut seeds[index].1
    } else {
        seeds.push((name.to_string(), CourseSeed::default()));
        let last = seeds.len() - 1;
        &mut seeds[last].1
    }
}

struct CoursePopulator {
    ctx: Catalog,
    semester: String,
    name: String,
    seed: CourseSeed,
}

impl Populate for CoursePopulator {
    fn populate(&self, dir: &NodeRef) -> Result<()> {
        let labels = &self.ctx.labels;
        let mut metadata = RecordFile::new(dir);
        dir.add(
            &labels.file_course_metadata,
            metadata.node(),
            DuplicatePolicy::Reject,
        )?;
        metadata.add(&labels.attr_name, self.name.as_str(), "crs_cname")?;
        metadata.add(&labels.attr_class, self.seed.class_no.as_str(), "class_no")?;
        if !self.seed.sn.is_empty() {
            metadata.add(&labels.attr_serial, self.seed.sn.as_str(), "course_sn")?;
        }
        if !self.seed.times.is_empty() {
            metadata.add(
                &labels.attr_time,
                times_value(&self.seed.times),
                json!(["day", "slot"]),
            )?;
        }

        // Calendar-only entries have no platform id and nothing more to
        // fetch.
        if self.seed.sn.is_empty() {
            metadata.finish()?;
            return Ok(());
        }

        // The platform requires a semester call before any course call.
        self.ctx.api(
            &[("mode", "semester"), ("semester", &self.semester)],
            Reuse::SkipIfRepeated,
        )?;
        // The class number is mandatory for the full course payload.
        let result = self.ctx.api_fresh(&[
            ("mode", "course"),
            ("semester", &self.semester),
            ("course_sn", &self.seed.sn),
            ("class_no", &self.seed.class_no),
        ])?;

        let lang = match str_field(&result, "lang")? {
            "big5" => labels.value_language_native.as_str(),
            "eng" => labels.value_language_english.as_str(),
            other => {
                return Err(Error::malformed(format!(
                    "unrecognized course language {other}"
                )));
            }
        };
        metadata.add(&labels.attr_language, lang, "lang")?;

        let info = field(&result, "course_info")?;
        metadata.add(&labels.attr_course_code, str_field(info, "dpt_cou")?, "dpt_cou")?;
        metadata.add(&labels.attr_place, str_field(info, "place")?, "place")?;
        let mark = str_field(info, "mark")?;
        if !mark.is_empty() {
            metadata.add(&labels.attr_remark, mark, "mark")?;
        }
        if let Some(reqs) = info.get("course_req").and_then(Value::as_array)
            && !reqs.is_empty()
        {
            let mut evaluation = Vec::new();
            for req in reqs {
                let mut entry = Map::new();
                entry.insert(
                    labels.attr_item.clone(),
                    fold_multiline(field(req, "item")?.clone()),
                );
                entry.insert(
                    labels.attr_percent.clone(),
                    fold_multiline(field(req, "percent")?.clone()),
                );
                entry.insert(
                    labels.attr_notes.clone(),
                    fold_multiline(field(req, "notes")?.clone()),
                );
                evaluation.push(Value::Object(entry));
            }
            metadata.add(&labels.attr_evaluation, Value::Array(evaluation), "course_req")?;
        }
        metadata.finish()?;

        if let Some(bulletin) = result.get("bulletin").and_then(Value::as_array) {
            let node = Node::new_lazy_dir(
                dir,
                Box::new(AnnouncementsPopulator {
                    ctx: self.ctx.clone(),
                    course_sn: self.seed.sn.clone(),
                    bulletin: bulletin.to_vec(),
                }),
            );
            dir.add(&labels.dir_announcements, node, DuplicatePolicy::Reject)?;
        }

        let contents = arr_field(&result, "contents")?.to_vec();
        let content_files = arr_field(&result, "content_files")?.to_vec();
        let node = Node::new_lazy_dir(
            dir,
            Box::new(ContentsPopulator {
                ctx: self.ctx.clone(),
                course_sn: self.seed.sn.clone(),
                contents,
                content_files,
            }),
        );
        dir.add(&labels.dir_contents, node, DuplicatePolicy::Reject)?;

        if result.get("board").is_some() {
            let node = Node::new_lazy_dir(
                dir,
                Box::new(BoardsPopulator {
                    ctx: self.ctx.clone(),
                    semester: self.semester.clone(),
                    course_sn: self.seed.sn.clone(),
                }),
            );
            dir.add(&labels.dir_boards, node, DuplicatePolicy::Reject)?;
        }

        if let Some(homeworks) = result.get("homeworks").and_then(Value::as_array) {
            let node = Node::new_lazy_dir(
                dir,
                Box::new(HomeworksPopulator {
                    ctx: self.ctx.clone(),
                    course_sn: self.seed.sn.clone(),
                    homeworks: homeworks.to_vec(),
                }),
            );
            dir.add(&labels.dir_homeworks, node, DuplicatePolicy::Reject)?;
        }

        if let Some(grades) = result.get("course_grade").and_then(Value::as_array) {
            let node = Node::new_lazy_dir(
                dir,
                Box::new(GradesPopulator {
                    ctx: self.ctx.clone(),
                    grades: grades.to_vec(),
                }),
            );
            dir.add(&labels.dir_grades, node, DuplicatePolicy::Reject)?;
        }
        Ok(())
    }
}

fn times_value(times: &[(u64, String)]) -> Value {
    Value::Array(
        times
            .iter()
            .map(|(day, slot)| json!([DAYS.get(*day as usize).copied().unwrap_or("?"), slot]))
            .collect(),
    )
}

struct AnnouncementsPopulator {
    ctx: Catalog,
    course_sn: String,
    bulletin: Vec<Value>,
}

impl Populate for AnnouncementsPopulator {
    fn populate(&self, dir: &NodeRef) -> Result<()> {
        let labels = &self.ctx.labels;
        let mut attachments: Option<NodeRef> = None;
        for anno in &self.bulletin {
            let sn = str_field(anno, "sn")?;
            let subject = str_field(anno, "subject")?;
            let mut record = RecordFile::new(dir);
            record.add(&labels.attr_serial, sn, "sn")?;
            record.add(&labels.attr_subject, subject, "subject")?;
            record.add(&labels.attr_date, field(anno, "post_time")?.clone(), "post_time")?;
            record.add(&labels.attr_url, field(anno, "b_link")?.clone(), "b_link")?;
            record.add(&labels.attr_attachment, field(anno, "attach")?.clone(), "attach")?;
            record.add(&labels.attr_content, field(anno, "content")?.clone(), "content")?;
            dir.add(
                &record_filename(sn, subject, "json")?,
                record.finish()?,
                DuplicatePolicy::Reject,
            )?;

            let attach = str_field(anno, "attach")?;
            if !attach.is_empty() {
                let att_dir = attachments
                    .get_or_insert_with(|| Node::new_plain_dir(dir))
                    .clone();
                let file = files::remote_file(
                    &att_dir,
                    &self.ctx.source,
                    format!("/course/{}/bulletin/{attach}", self.course_sn),
                    Vec::new(),
                );
                // Several announcements may reference the same attachment.
                att_dir.add(attach, file, DuplicatePolicy::Ignore)?;
            }
        }
        if let Some(att_dir) = attachments {
            att_dir.mark_ready()?;
            dir.add(&labels.dir_attachments, att_dir, DuplicatePolicy::Reject)?;
        }
        Ok(())
    }
}

struct ContentsPopulator {
    ctx: Catalog,
    course_sn: String,
    contents: Vec<Value>,
    content_files: Vec<Value>,
}

impl Populate for ContentsPopulator {
    fn populate(&self, dir: &NodeRef) -> Result<()> {
        let labels = &self.ctx.labels;
        let mut records: Vec<(String, RecordFile)> = Vec::new();

        for content in &self.contents {
            // An empty contents section arrives as one bare array.
            if content.is_array() {
                break;
            }
            let sn = str_field(content, "syl_sn")?;
            let mut record = RecordFile::new(dir);
            record.add(&labels.attr_serial, sn, "syl_sn")?;
            record.add(&labels.attr_week, field(content, "unit")?.clone(), "unit")?;
            record.add(&labels.attr_date, field(content, "notes")?.clone(), "notes")?;
            record.add(&labels.attr_subject, field(content, "subject")?.clone(), "subject")?;
            record.add(&labels.attr_files, json!([]), "file_name")?;
            records.push((sn.to_string(), record));
        }

        for content_file in &self.content_files {
            let sn = str_field(content_file, "syl_sn")?;
            let file_name = str_field(content_file, "file_name")?;
            let Some((_, record)) = records.iter_mut().find(|(existing, _)| existing == sn)
            else {
                return Err(Error::malformed(format!(
                    "content file references unknown unit {sn}"
                )));
            };
            record.append(&labels.attr_files, file_name)?;
        }

        for (sn, record) in records {
            let week = record
                .get(&labels.attr_week)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            dir.add(
                &record_filename(&sn, &week, "json")?,
                record.finish()?,
                DuplicatePolicy::Reject,
            )?;
        }

        if !self.content_files.is_empty() {
            let files_dir = Node::new_plain_dir(dir);
            for content_file in &self.content_files {
                let file_name = str_field(content_file, "file_name")?;
                let file = files::remote_file(
                    &files_dir,
                    &self.ctx.source,
                    format!("/course/{}/content/{file_name}", self.course_sn),
                    Vec::new(),
                );
                files_dir.add(file_name, file, DuplicatePolicy::Ignore)?;
            }
            files_dir.mark_ready()?;
            dir.add(&labels.dir_content_files, files_dir, DuplicatePolicy::Reject)?;
        }
        Ok(())
    }
}

struct BoardsPopulator {
    ctx: Catalog,
    semester: String,
    course_sn: String,
}

impl Populate for BoardsPopulator {
    fn populate(&self, dir: &NodeRef) -> Result<()> {
        self.ctx.api(
            &[("mode", "semester"), ("semester", &self.semester)],
            Reuse::SkipIfRepeated,
        )?;
        let result = self.ctx.api_fresh(&[
            ("mode", "read_board"),
            ("semester", &self.semester),
            ("course_sn", &self.course_sn),
            ("board", "0"),
        ])?;
        let boards = result
            .as_array()
            .ok_or_else(|| Error::malformed("board list is not an array"))?;
        for board in boards {
            let sn = str_field(board, "sn")?;
            let caption = str_field(board, "caption")?;
            let node = Node::new_lazy_dir(
                dir,
                Box::new(BoardThreadsPopulator {
                    ctx: self.ctx.clone(),
                    semester: self.semester.clone(),
                    course_sn: self.course_sn.clone(),
                    board_sn: sn.to_string(),
                    caption: caption.to_string(),
                }),
            );
            dir.add(&record_dirname(sn, caption)?, node, DuplicatePolicy::Reject)?;
        }
        Ok(())
    }
}

struct BoardThreadsPopulator {
    ctx: Catalog,
    semester: String,
    course_sn: String,
    board_sn: String,
    caption: String,
}

impl Populate for BoardThreadsPopulator {
    fn populate(&self, dir: &NodeRef) -> Result<()> {
        let labels = &self.ctx.labels;

        let mut metadata = RecordFile::new(dir);
        metadata.add(&labels.attr_serial, self.board_sn.as_str(), "sn")?;
        metadata.add(&labels.attr_caption, self.caption.as_str(), "caption")?;
        dir.add(
            &labels.file_board_metadata,
            metadata.finish()?,
            DuplicatePolicy::Reject,
        )?;

        self.ctx.api(
            &[("mode", "semester"), ("semester", &self.semester)],
            Reuse::SkipIfRepeated,
        )?;
        let result = self.ctx.api_fresh(&[
            ("mode", "read_board_post"),
            ("semester", &self.semester),
            ("course_sn", &self.course_sn),
            ("board", &self.board_sn),
        ])?;
        let posts = result
            .as_array()
            .ok_or_else(|| Error::malformed("post list is not an array"))?;

        // Group posts into threads keyed by their root post, preserving
        // first-appearance order.
        let mut threads: Vec<(String, Vec<&Value>)> = Vec::new();
        for post in posts {
            let sn = str_field(post, "sn")?;
            let parent = str_field(post, "parent")?;
            let key = if parent == "0" { sn } else { parent };
            if let Some(index) = threads.iter().position(|(existing, _)| existing == key) {
                threads[index].1.push(post);
            } else {
                threads.push((key.to_string(), vec![post]));
            }
        }

        for (thread_sn, posts) in threads {
            let thread_dir = Node::new_plain_dir(dir);
            let mut thread_subject = None;
            let mut attachments: Vec<(String, String, String)> = Vec::new();

            for post in posts {
                let sn = str_field(post, "sn")?;
                let parent = str_field(post, "parent")?;
                let subject = str_field(post, "subject")?;
                if parent == "0" || thread_subject.is_none() {
                    thread_subject = Some(subject.to_string());
                }

                let mut record = RecordFile::new(&thread_dir);
                record.add(&labels.attr_serial, sn, "sn")?;
                if parent != "0" {
                    record.add(&labels.attr_parent_post, parent, "parent")?;
                }
                record.add(&labels.attr_subject, subject, "subject")?;
                record.add(&labels.attr_posted, field(post, "post_time")?.clone(), "post_time")?;
                let attach = str_field(post, "attach")?;
                let file_path = str_field(post, "file_path")?;
                if !attach.is_empty() {
                    record.add(&labels.attr_attachment, attach, "attach")?;
                    if !file_path.is_empty() {
                        attachments.push((
                            sn.to_string(),
                            attach.to_string(),
                            file_path.to_string(),
                        ));
                    }
                }
                record.add(&labels.attr_author, field(post, "author")?.clone(), "author")?;
                record.add(
                    &labels.attr_author_name,
                    field(post, "cauthor")?.clone(),
                    "cauthor",
                )?;
                record.add(
                    &labels.attr_replies,
                    field(post, "count_rep")?.clone(),
                    "count_rep",
                )?;
                record.add(
                    &labels.attr_last_reply,
                    field(post, "latest_rep")?.clone(),
                    "latest_rep",
                )?;
                thread_dir.add(
                    &record_filename(sn, subject, "json")?,
                    record.finish()?,
                    DuplicatePolicy::Reject,
                )?;

                let body = render_post_html(subject, str_field(post, "content")?);
                thread_dir.add(
                    &record_filename(sn, subject, "html")?,
                    files::string_file(&thread_dir, body),
                    DuplicatePolicy::Reject,
                )?;
            }

            if !attachments.is_empty() {
                let files_dir = Node::new_plain_dir(&thread_dir);
                for (sn, attach, file_path) in &attachments {
                    let file = files::remote_file(
                        &files_dir,
                        &self.ctx.source,
                        format!("/course/{}/board/{file_path}", self.course_sn),
                        Vec::new(),
                    );
                    files_dir.add(&record_dirname(sn, attach)?, file, DuplicatePolicy::Reject)?;
                }
                files_dir.mark_ready()?;
                thread_dir.add(&labels.dir_thread_files, files_dir, DuplicatePolicy::Reject)?;
            }

            thread_dir.mark_ready()?;
            let subject = thread_subject.unwrap_or_default();
            dir.add(
                &record_dirname(&thread_sn, &subject)?,
                thread_dir,
                DuplicatePolicy::Reject,
            )?;
        }
        Ok(())
    }
}

struct HomeworksPopulator {
    ctx: Catalog,
    course_sn: String,
    homeworks: Vec<Value>,
}

impl Populate for HomeworksPopulator {
    fn populate(&self, dir: &NodeRef) -> Result<()> {
        for hw in &self.homeworks {
            let sn = str_field(hw, "sn")?;
            let name = str_field(hw, "name")?;
            let node = Node::new_lazy_dir(
                dir,
                Box::new(HomeworkPopulator {
                    ctx: self.ctx.clone(),
                    course_sn: self.course_sn.clone(),
                    hw: hw.clone(),
                }),
            );
            dir.add(&record_dirname(sn, name)?, node, DuplicatePolicy::Reject)?;
        }
        Ok(())
    }
}

struct HomeworkPopulator {
    ctx: Catalog,
    course_sn: String,
    hw: Value,
}

impl Populate for HomeworkPopulator {
    fn populate(&self, dir: &NodeRef) -> Result<()> {
        let labels = &self.ctx.labels;
        let hw = &self.hw;
        let sn = str_field(hw, "sn")?;

        let mut record = RecordFile::new(dir);
        record.add(&labels.attr_serial, sn, "sn")?;
        record.add(&labels.attr_name, str_field(hw, "name")?, "name")?;
        let description = str_field(hw, "description")?.replace("<br>", "");
        record.add(&labels.attr_description, description, "description")?;
        let file_path = str_field(hw, "file_path")?;
        record.add(&labels.attr_related_file, file_path, "file_path")?;
        let url = str_field(hw, "url")?;
        record.add(&labels.attr_url, url, "url")?;
        record.add(
            &labels.attr_published,
            date_hour(str_field(hw, "pub_date")?, str_field(hw, "pub_hour")?),
            json!(["pub_date", "pub_hour"]),
        )?;
        let end_date = str_field(hw, "end_date")?;
        let end_hour = str_field(hw, "end_hour")?;
        // The platform encodes "no deadline" as the last hour of 2030.
        if end_date == "2030-12-31" && end_hour == "24" {
            record.add(
                &labels.attr_deadline,
                labels.value_deadline_none.as_str(),
                json!(["end_date", "end_hour"]),
            )?;
        } else {
            record.add(
                &labels.attr_deadline,
                date_hour(end_date, end_hour),
                json!(["end_date", "end_hour"]),
            )?;
        }
        // The flag is inverted relative to its name; the official client
        // renders it the same way.
        let late = match str_field(hw, "is_subm")? {
            "0" => labels.value_yes.as_str(),
            "1" => labels.value_no.as_str(),
            other => {
                return Err(Error::malformed(format!(
                    "unrecognized late-submission flag {other}"
                )));
            }
        };
        record.add(&labels.attr_late_submission, late, "is_subm")?;
        dir.add(&labels.file_homework, record.finish()?, DuplicatePolicy::Reject)?;

        if !url.is_empty() {
            dir.add(
                &labels.attr_url,
                Node::new_external_link(dir, url),
                DuplicatePolicy::Reject,
            )?;
        }

        if !file_path.is_empty() {
            let files_dir = Node::new_plain_dir(dir);
            let file = files::remote_file(
                &files_dir,
                &self.ctx.source,
                format!("/course/{}/hw/{file_path}", self.course_sn),
                Vec::new(),
            );
            files_dir.add(file_path, file, DuplicatePolicy::Reject)?;
            files_dir.mark_ready()?;
            dir.add(&labels.dir_homework_files, files_dir, DuplicatePolicy::Reject)?;
        }

        if let Some(scores) = hw.get("hw_scores").and_then(Value::as_array)
            && !scores.is_empty()
        {
            let scores_dir = Node::new_plain_dir(dir);
            for (index, score) in scores.iter().enumerate() {
                let mut entry = RecordFile::new(&scores_dir);
                entry.add(
                    &labels.attr_submitted_at,
                    field(score, "hand_time")?.clone(),
                    "hand_time",
                )?;
                entry.add(
                    &labels.attr_submitted_file,
                    field(score, "file_path")?.clone(),
                    "file_path",
                )?;
                entry.add(
                    &labels.attr_letter_grade,
                    field(score, "ranking_grade")?.clone(),
                    "ranking_grade",
                )?;
                entry.add(&labels.attr_score, field(score, "score")?.clone(), "score")?;
                entry.add(
                    &labels.attr_comment,
                    field(score, "evaluation")?.clone(),
                    "evaluation",
                )?;
                scores_dir.add(
                    &format!("{:04}.json", index + 1),
                    entry.finish()?,
                    DuplicatePolicy::Reject,
                )?;
            }
            scores_dir.mark_ready()?;
            dir.add(&labels.dir_homework_scores, scores_dir, DuplicatePolicy::Reject)?;
        }
        Ok(())
    }
}

struct GradesPopulator {
    ctx: Catalog,
    grades: Vec<Value>,
}

impl Populate for GradesPopulator {
    fn populate(&self, dir: &NodeRef) -> Result<()> {
        let labels = &self.ctx.labels;
        let mut table = TableFile::new(dir);
        dir.add(&labels.file_grades_table, table.node(), DuplicatePolicy::Reject)?;
        table.add([
            labels.attr_main_serial.as_str(),
            labels.attr_sub_serial.as_str(),
            labels.attr_tier.as_str(),
            labels.attr_item.as_str(),
            labels.attr_weight.as_str(),
            labels.attr_grading.as_str(),
            labels.attr_notes.as_str(),
            labels.attr_grade.as_str(),
            labels.attr_comment.as_str(),
            labels.attr_show.as_str(),
            labels.attr_changed.as_str(),
        ]);

        let mut index = 0;
        for grade in &self.grades {
            index += 1;
            self.emit_row(dir, &mut table, grade, None, index)?;
            if let Some(subs) = grade.get("sub").and_then(Value::as_array) {
                for sub in subs {
                    index += 1;
                    self.emit_row(dir, &mut table, grade, Some(sub), index)?;
                }
            }
        }
        table.finish()?;
        Ok(())
    }
}

impl GradesPopulator {
    fn emit_row(
        &self,
        dir: &NodeRef,
        table: &mut TableFile,
        main: &Value,
        sub: Option<&Value>,
        index: u32,
    ) -> Result<()> {
        let labels = &self.ctx.labels;
        let row = sub.unwrap_or(main);

        let main_sn = str_field(main, "main_sn")?;
        let sub_sn = sub.map(|s| str_field(s, "sub_sn")).transpose()?;
        let tier = match sub {
            Some(_) => labels.value_tier_sub.as_str(),
            None => match str_field(main, "tier")? {
                "0" => labels.value_tier_attendance.as_str(),
                "1" => labels.value_tier_main.as_str(),
                "2" => labels.value_tier_main_with_sub.as_str(),
                "3" => labels.value_tier_semester.as_str(),
                other => {
                    return Err(Error::malformed(format!("unrecognized grade tier {other}")));
                }
            },
        };
        let item = str_field(row, "item")?;
        let weight = format!("{}%", str_field(row, "percent")?);
        let grading = match str_field(row, "grade_isranking")? {
            "0" => labels.value_grading_percent.as_str(),
            "1" => labels.value_grading_letter.as_str(),
            "" => labels.value_grading_unknown.as_str(),
            other => {
                return Err(Error::malformed(format!(
                    "unrecognized grading system {other}"
                )));
            }
        };
        let notes = str_field(row, "notes")?;
        let grade_value = row.get("grade").and_then(Value::as_str);
        let comment = row.get("evaluation").and_then(Value::as_str);
        let show = match str_field(row, "show")? {
            "N" => labels.value_show_hidden.as_str(),
            "P" => labels.value_show_personal.as_str(),
            other => {
                return Err(Error::malformed(format!(
                    "unrecognized grade visibility {other}"
                )));
            }
        };
        let changed = str_field(row, "is_changed")?;

        let mut record = RecordFile::new(dir);
        record.add(&labels.attr_main_serial, main_sn, "main_sn")?;
        if let Some(sub_sn) = sub_sn {
            record.add(&labels.attr_sub_serial, sub_sn, "sub_sn")?;
        }
        record.add(&labels.attr_tier, tier, "tier")?;
        record.add(&labels.attr_item, item, "item")?;
        record.add(&labels.attr_weight, weight.as_str(), "percent")?;
        record.add(&labels.attr_grading, grading, "grade_isranking")?;
        record.add(&labels.attr_notes, notes, "notes")?;
        if let Some(grade_value) = grade_value {
            record.add(&labels.attr_grade, grade_value, "grade")?;
        }
        if let Some(comment) = comment {
            record.add(&labels.attr_comment, comment, "evaluation")?;
        }
        record.add(&labels.attr_show, show, "show")?;
        record.add(&labels.attr_changed, changed, "is_changed")?;

        let mut filename = format!("{index:02} {:08}", parse_serial(main_sn)?);
        if let Some(sub_sn) = sub_sn {
            filename.push_str(&format!("-{:08}", parse_serial(sub_sn)?));
        }
        filename.push_str(&format!(" {}.json", item.trim().trim_end_matches('.')));
        dir.add(&filename, record.finish()?, DuplicatePolicy::Reject)?;

        table.add([
            main_sn,
            sub_sn.unwrap_or(""),
            tier,
            item,
            weight.as_str(),
            grading,
            notes,
            grade_value.unwrap_or(""),
            comment.unwrap_or(""),
            show,
            changed,
        ]);
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Manually-added courses (edit overlay), scraped from the info page
// ---------------------------------------------------------------------

struct ManualCoursePopulator {
    ctx: Catalog,
    semester: String,
    course_sn: String,
    discovered_name: Rc<RefCell<Option<String>>>,
}

const INFO_PATH: &str = "/modules/info/info.php";
const HW_LIST_PATH: &str = "/modules/hw/hw.php";

impl Populate for ManualCoursePopulator {
    fn populate(&self, dir: &NodeRef) -> Result<()> {
        let labels = &self.ctx.labels;

        // Visit the course frame so the info page answers in this session.
        self.ctx.web_fresh(
            "/modules/index.php",
            &[("csn", &self.course_sn), ("default_fun", "info")],
        )?;
        let page = self.ctx.web_fresh(INFO_PATH, &[])?;
        let rows = info_rows(&page)?;

        // Fixed row layout of the info table: name, semester, teacher,
        // course code, class, time, place.
        let name = info_row(&rows, 0)?.to_string();
        let page_semester = info_row(&rows, 1)?;
        if page_semester != self.semester {
            tracing::warn!(
                course_sn = %self.course_sn,
                configured = %self.semester,
                actual = %page_semester,
                "manually added course sits in a different semester directory"
            );
        }

        let mut metadata = RecordFile::new(dir);
        metadata.add(&labels.attr_name, name.as_str(), INFO_PATH)?;
        metadata.add(&labels.attr_class, info_row(&rows, 4)?, INFO_PATH)?;
        metadata.add(&labels.attr_serial, self.course_sn.as_str(), "configuration")?;
        metadata.add(&labels.attr_time, info_row(&rows, 5)?, INFO_PATH)?;
        metadata.add(&labels.attr_course_code, info_row(&rows, 3)?, INFO_PATH)?;
        metadata.add(&labels.attr_place, info_row(&rows, 6)?, INFO_PATH)?;
        dir.add(
            &labels.file_course_metadata,
            metadata.finish()?,
            DuplicatePolicy::Reject,
        )?;

        *self.discovered_name.borrow_mut() = Some(name);

        if self
            .ctx
            .function_enabled(&self.course_sn, "hw", HW_LIST_PATH)?
        {
            let node = Node::new_lazy_dir(
                dir,
                Box::new(WebHomeworksPopulator {
                    ctx: self.ctx.clone(),
                    course_sn: self.course_sn.clone(),
                }),
            );
            dir.add(&labels.dir_homeworks, node, DuplicatePolicy::Reject)?;
        }
        Ok(())
    }
}

/// Homework list for courses only reachable through the web realm; the
/// structured API does not know unenrolled courses, so only the listing
/// (id and title) is available.
struct WebHomeworksPopulator {
    ctx: Catalog,
    course_sn: String,
}

impl Populate for WebHomeworksPopulator {
    fn populate(&self, dir: &NodeRef) -> Result<()> {
        let labels = &self.ctx.labels;
        self.ctx.web_fresh(
            "/modules/index.php",
            &[("csn", &self.course_sn), ("default_fun", "hw")],
        )?;
        let page = self.ctx.web_fresh(HW_LIST_PATH, &[])?;

        let rows = selector("div#sect_cont table tr")?;
        let anchors = selector("a")?;
        for row in page.select(&rows).skip(1) {
            let Some(anchor) = row.select(&anchors).next() else {
                continue;
            };
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let Some(sn) = query_arg(href, "hw_sn") else {
                return Err(Error::malformed("homework row link carries no hw_sn"));
            };
            let name = cell_text(anchor);

            let hw_dir = Node::new_plain_dir(dir);
            let mut record = RecordFile::new(&hw_dir);
            record.add(&labels.attr_serial, sn.as_str(), HW_LIST_PATH)?;
            record.add(&labels.attr_name, name.as_str(), HW_LIST_PATH)?;
            hw_dir.add(
                &labels.file_homework,
                record.finish()?,
                DuplicatePolicy::Reject,
            )?;
            hw_dir.mark_ready()?;
            dir.add(&record_dirname(&sn, &name)?, hw_dir, DuplicatePolicy::Reject)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------

fn field<'a>(value: &'a Value, key: &str) -> Result<&'a Value> {
    value
        .get(key)
        .ok_or_else(|| Error::malformed(format!("response field {key} is missing")))
}

fn str_field<'a>(value: &'a Value, key: &str) -> Result<&'a str> {
    field(value, key)?
        .as_str()
        .ok_or_else(|| Error::malformed(format!("response field {key} is not a string")))
}

fn arr_field<'a>(value: &'a Value, key: &str) -> Result<&'a Vec<Value>> {
    field(value, key)?
        .as_array()
        .ok_or_else(|| Error::malformed(format!("response field {key} is not an array")))
}

fn parse_serial(sn: &str) -> Result<u64> {
    sn.trim()
        .parse()
        .map_err(|_| Error::malformed(format!("serial {sn} is not numeric")))
}

/// Directory name for a numbered record: zero-padded serial plus the
/// trimmed title without trailing dots.
fn record_dirname(sn: &str, title: &str) -> Result<String> {
    Ok(format!(
        "{:08} {}",
        parse_serial(sn)?,
        title.trim().trim_end_matches('.')
    ))
}

/// File name for a numbered record with an extension
fn record_filename(sn: &str, title: &str, extension: &str) -> Result<String> {
    Ok(format!("{}.{extension}", record_dirname(sn, title)?))
}

fn date_hour(date: &str, hour: &str) -> String {
    format!("{date} {hour}")
}

fn selector(rule: &str) -> Result<Selector> {
    Selector::parse(rule).map_err(|_| Error::invalid_op(format!("invalid selector {rule}")))
}

fn cell_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .replace('\u{a0}', " ")
        .trim()
        .to_string()
}

/// The `(header, value)` rows of the course info table
fn info_rows(page: &Html) -> Result<Vec<(String, String)>> {
    let rows = selector("div#sect_cont table tr")?;
    let headers = selector("th")?;
    let cells = selector("td")?;
    let mut out = Vec::new();
    for row in page.select(&rows) {
        let Some(header) = row.select(&headers).next() else {
            continue;
        };
        let Some(cell) = row.select(&cells).next() else {
            continue;
        };
        out.push((cell_text(header), cell_text(cell)));
    }
    Ok(out)
}

fn info_row<'a>(rows: &'a [(String, String)], index: usize) -> Result<&'a str> {
    rows.get(index)
        .map(|(_, value)| value.as_str())
        .ok_or_else(|| Error::malformed(format!("info table is missing row {index}")))
}

fn query_arg(href: &str, key: &str) -> Option<String> {
    let (_, query) = href.split_once('?')?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// The rendered HTML wrapper around a post body, title-escaped; the body
/// is platform-authored HTML and passes through untouched.
fn render_post_html(subject: &str, content: &str) -> String {
    format!(
        concat!(
            "<!DOCTYPE HTML PUBLIC \"-//W3C//DTD HTML 4.01 Transitional//EN\"\n",
            "  \"http://www.w3.org/TR/html4/loose.dtd\">\n",
            "<html>\n",
            "  <head>\n",
            "    <meta http-equiv=\"Content-Type\" content=\"text/html; charset=UTF-8\">\n",
            "    <title>{}</title>\n",
            "  </head>\n",
            "  <body>\n",
            "    <p>\n",
            "      {}\n",
            "    </p>\n",
            "  </body>\n",
            "</html>\n",
        ),
        html_escape(subject),
        content
    )
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_names_zero_pad_and_trim() {
        assert_eq!(record_dirname("17", " Week one. ").unwrap(), "00000017 Week one");
        assert_eq!(
            record_filename("17", "Week one", "json").unwrap(),
            "00000017 Week one.json"
        );
        assert!(matches!(
            record_dirname("abc", "x"),
            Err(Error::MalformedResponse { .. })
        ));
    }

    #[test]
    fn times_render_day_names() {
        let times = vec![(2, "789".to_string())];
        assert_eq!(times_value(&times), json!([["Wed", "789"]]));
    }

    #[test]
    fn query_arg_reads_url_encoded_values() {
        assert_eq!(
            query_arg("hw_show.php?hw_sn=123&all=1", "hw_sn").as_deref(),
            Some("123")
        );
        assert_eq!(query_arg("hw.php", "hw_sn"), None);
        assert_eq!(
            query_arg("show.php?name=a%20b", "name").as_deref(),
            Some("a b")
        );
    }

    #[test]
    fn post_html_escapes_the_title_only() {
        let html = render_post_html("a < b", "<b>bold</b>");
        assert!(html.contains("<title>a &lt; b</title>"));
        assert!(html.contains("<b>bold</b>"));
    }

    #[test]
    fn info_rows_pair_headers_with_values() {
        let page = Html::parse_document(
            r#"<div id="sect_cont"><table>
                <tr><th>Course Name</th><td>Algorithms</td></tr>
                <tr><th>Semester</th><td>112-1</td></tr>
            </table></div>"#,
        );
        let rows = info_rows(&page).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], ("Course Name".to_string(), "Algorithms".to_string()));
        assert_eq!(info_row(&rows, 1).unwrap(), "112-1");
        assert!(matches!(
            info_row(&rows, 9),
            Err(Error::MalformedResponse { .. })
        ));
    }
}
