//! 同步计划：决定哪些章节需要下载、推断缺失的章节号、应用排除规则。
//!
//! 输入为按创建时间从旧到新排列的章节列表，输出保持输入顺序，每个章节恰好一条记录。

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tracing::warn;

use super::models::ChapterRef;
use crate::base_system::series_paths::{chapter_file_name, modified_time, most_recent_modified};

/// 截止时间（"since"）：`updated_at` 不晚于该时刻的章节跳过。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cutoff {
    None,
    At(OffsetDateTime),
    /// 取目标目录中最新归档的修改时间；目录为空时不设截止。
    MostRecentLocal,
}

#[derive(Debug, Error)]
#[error("invalid since value {0:?}: expected \"auto\", an RFC 3339 time or YYYY-MM-DD")]
pub struct InvalidCutoff(pub String);

impl Cutoff {
    pub fn parse(value: Option<&str>) -> Result<Self, InvalidCutoff> {
        let Some(raw) = value.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(Self::None);
        };
        if raw.eq_ignore_ascii_case("auto") {
            return Ok(Self::MostRecentLocal);
        }
        if let Ok(at) = OffsetDateTime::parse(raw, &Rfc3339) {
            return Ok(Self::At(at));
        }
        Date::parse(raw, format_description!("[year]-[month]-[day]"))
            .map(|d| Self::At(d.midnight().assume_utc()))
            .map_err(|_| InvalidCutoff(raw.to_string()))
    }

    fn resolve(&self, dest_dir: &Path) -> Option<OffsetDateTime> {
        match self {
            Self::None => None,
            Self::At(at) => Some(*at),
            Self::MostRecentLocal => most_recent_modified(dest_dir),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    Excluded(String),
    External(String),
    NoNumber,
    NotAfterCutoff(OffsetDateTime),
    BelowFloor(f64),
    UpToDate(PathBuf),
    Duplicate,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Excluded(key) => write!(f, "excluded by {key:?}"),
            Self::External(url) => write!(f, "hosted externally at {url}"),
            Self::NoNumber => f.write_str("no chapter number could be inferred"),
            Self::NotAfterCutoff(at) => write!(f, "not updated since {at}"),
            Self::BelowFloor(floor) => write!(f, "below chapter {floor}"),
            Self::UpToDate(path) => write!(f, "up to date at {}", path.display()),
            Self::Duplicate => f.write_str("listed twice"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannedChapter {
    pub chapter: ChapterRef,
    /// 来源给出的或推断出的章节号。
    pub number: String,
    pub label: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub enum PlanEntry {
    Download(PlannedChapter),
    Skip {
        chapter: ChapterRef,
        label: String,
        reason: SkipReason,
    },
}

impl PlanEntry {
    #[cfg(test)]
    pub fn chapter(&self) -> &ChapterRef {
        match self {
            Self::Download(p) => &p.chapter,
            Self::Skip { chapter, .. } => chapter,
        }
    }

    #[cfg(test)]
    pub fn is_download(&self) -> bool {
        matches!(self, Self::Download(_))
    }
}

pub struct SyncPolicy {
    dest_dir: PathBuf,
    cutoff: Option<OffsetDateTime>,
    exclusions: HashSet<String>,
    floor: Option<f64>,
}

impl SyncPolicy {
    /// `MostRecentLocal` 在构造时求值一次，同步过程中写入的新归档不影响本轮判断。
    pub fn new(dest_dir: &Path, cutoff: &Cutoff, exclusions: &[String], floor: Option<f64>) -> Self {
        Self {
            dest_dir: dest_dir.to_path_buf(),
            cutoff: cutoff.resolve(dest_dir),
            exclusions: exclusions
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            floor,
        }
    }

    pub fn cutoff(&self) -> Option<OffsetDateTime> {
        self.cutoff
    }

    pub fn plan(&self, chapters: &[ChapterRef]) -> Vec<PlanEntry> {
        let mut seen = HashSet::new();
        chapters
            .iter()
            .enumerate()
            .map(|(index, chapter)| {
                let entry = if seen.insert(chapter.id.as_str()) {
                    self.decide(chapters, index)
                } else {
                    Err(SkipReason::Duplicate)
                };
                entry.unwrap_or_else(|reason| PlanEntry::Skip {
                    chapter: chapter.clone(),
                    label: label(known_number(chapter).unwrap_or("?"), &chapter.translator),
                    reason,
                })
            })
            .collect()
    }

    fn decide(&self, chapters: &[ChapterRef], index: usize) -> Result<PlanEntry, SkipReason> {
        let chapter = &chapters[index];

        if let Some(key) = self.excluded_by(chapter) {
            return Err(SkipReason::Excluded(key));
        }
        if let Some(url) = chapter.external_url.as_deref().filter(|u| !u.is_empty()) {
            return Err(SkipReason::External(url.to_string()));
        }

        let number = match known_number(chapter) {
            Some(n) => n.to_string(),
            None => match infer_number(chapters, index) {
                Some(n) => n,
                None => {
                    warn!(
                        target: "sync",
                        chapter = %chapter.id,
                        title = %chapter.title,
                        "章节缺少编号且无可参考的相邻章节，跳过"
                    );
                    return Err(SkipReason::NoNumber);
                }
            },
        };

        if let Some(cutoff) = self.cutoff {
            if chapter.updated_at <= cutoff {
                return Err(SkipReason::NotAfterCutoff(cutoff));
            }
        }
        if let (Some(floor), Ok(n)) = (self.floor, number.parse::<f64>()) {
            if n < floor {
                return Err(SkipReason::BelowFloor(floor));
            }
        }

        let path = self.dest_dir.join(chapter_file_name(
            &number,
            &chapter.translator,
            &chapter.id,
            chapter.created_at,
        ));
        if let Some(mtime) = modified_time(&path) {
            if OffsetDateTime::from(mtime) >= chapter.updated_at {
                return Err(SkipReason::UpToDate(path));
            }
        }

        Ok(PlanEntry::Download(PlannedChapter {
            chapter: chapter.clone(),
            label: label(&number, &chapter.translator),
            number,
            path,
        }))
    }

    fn excluded_by(&self, chapter: &ChapterRef) -> Option<String> {
        if self.exclusions.is_empty() {
            return None;
        }
        chapter
            .attributions
            .iter()
            .flat_map(|a| [a.id.as_str(), a.name.as_str()])
            .find(|key| self.exclusions.contains(&key.to_lowercase()))
            .map(str::to_string)
    }
}

fn known_number(chapter: &ChapterRef) -> Option<&str> {
    chapter
        .number
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
}

fn label(number: &str, translator: &str) -> String {
    format!("{number} by {translator}")
}

fn inference_offset(distance: usize) -> f64 {
    (0.1 * distance as f64).clamp(0.1, 0.9)
}

/// 用最近的已知编号推断缺失编号：优先向前找（`n + 偏移`），再向后找（`n - 偏移`），
/// 偏移为 `0.1 × 距离`，限制在 0.1..=0.9。相邻编号不是数字时原样沿用。
/// 只参考来源给出的编号，不使用已推断出的编号。
pub fn infer_number(chapters: &[ChapterRef], index: usize) -> Option<String> {
    let shifted = |raw: &str, distance: usize, sign: f64| match raw.parse::<f64>() {
        Ok(n) => format_number(n + sign * inference_offset(distance)),
        Err(_) => raw.to_string(),
    };

    let preceding = chapters[..index]
        .iter()
        .rev()
        .enumerate()
        .find_map(|(i, c)| known_number(c).map(|n| (n, i + 1)));
    if let Some((raw, distance)) = preceding {
        return Some(shifted(raw, distance, 1.0));
    }

    chapters
        .get(index + 1..)?
        .iter()
        .enumerate()
        .find_map(|(i, c)| known_number(c).map(|n| (n, i + 1)))
        .map(|(raw, distance)| shifted(raw, distance, -1.0))
}

/// 小数最多保留四位并去掉尾随零：`1.8000000000000003` → `1.8`，`3.0` → `3`。
pub fn format_number(value: f64) -> String {
    let text = format!("{value:.4}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_system::series_paths::set_modified;
    use crate::download::models::{Attribution, AttributionKind};
    use std::fs;
    use time::macros::datetime;

    fn ch(id: &str, number: Option<&str>, updated: OffsetDateTime) -> ChapterRef {
        let mut c = ChapterRef::new(id, number, updated);
        c.translator = "Team".into();
        c
    }

    fn numbers(entries: &[PlanEntry]) -> Vec<Option<String>> {
        entries
            .iter()
            .map(|e| match e {
                PlanEntry::Download(p) => Some(p.number.clone()),
                PlanEntry::Skip { .. } => None,
            })
            .collect()
    }

    fn policy(dir: &Path) -> SyncPolicy {
        SyncPolicy::new(dir, &Cutoff::None, &[], None)
    }

    #[test]
    fn output_preserves_order_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let t = datetime!(2024-01-01 00:00:00 UTC);
        let chapters = vec![
            ch("a", Some("1"), t),
            ch("b", Some("2"), t),
            ch("a", Some("1"), t),
            ch("c", Some("3"), t),
        ];
        let entries = policy(dir.path()).plan(&chapters);
        let ids: Vec<&str> = entries.iter().map(|e| e.chapter().id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "a", "c"]);
        assert!(matches!(
            entries[2],
            PlanEntry::Skip {
                reason: SkipReason::Duplicate,
                ..
            }
        ));
        assert_eq!(entries.iter().filter(|e| e.is_download()).count(), 3);
    }

    #[test]
    fn cutoff_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let cutoff = datetime!(2024-03-01 00:00:00 UTC);
        let chapters = vec![
            ch("before", Some("1"), datetime!(2024-02-01 00:00:00 UTC)),
            ch("equal", Some("2"), cutoff),
            ch("after", Some("3"), datetime!(2024-03-01 00:00:01 UTC)),
        ];
        let entries = SyncPolicy::new(dir.path(), &Cutoff::At(cutoff), &[], None).plan(&chapters);
        assert_eq!(numbers(&entries), vec![None, None, Some("3".into())]);
    }

    #[test]
    fn missing_numbers_are_inferred_from_neighbours() {
        let dir = tempfile::tempdir().unwrap();
        let t = datetime!(2024-01-01 00:00:00 UTC);
        let chapters = vec![
            ch("a", None, t),
            ch("b", None, t),
            ch("c", Some("2"), t),
            ch("d", None, t),
        ];
        let entries = policy(dir.path()).plan(&chapters);
        let got: Vec<f64> = numbers(&entries)
            .into_iter()
            .map(|n| n.unwrap().parse().unwrap())
            .collect();
        // 偏移 0.1 × 距离 在距离 2 时为 0.2，所以 1.8 这个端点本身就会出现
        assert_eq!(got[0], 1.8);
        assert!(got[0] < got[1] && got[1] < 2.0, "{got:?}");
        assert_eq!(got[2], 2.0);
        assert!(got[3] > 2.0 && got[3] < 3.0);
        assert_eq!(numbers(&entries)[3].as_deref(), Some("2.1"));
    }

    #[test]
    fn inference_offset_is_clamped_and_non_numeric_copied() {
        let t = datetime!(2024-01-01 00:00:00 UTC);
        let mut chapters = vec![ch("a", Some("5"), t)];
        chapters.extend((0..12).map(|i| ch(&format!("x{i}"), None, t)));
        assert_eq!(infer_number(&chapters, 12).as_deref(), Some("5.9"));

        let chapters = vec![ch("a", Some("Extra"), t), ch("b", None, t)];
        assert_eq!(infer_number(&chapters, 1).as_deref(), Some("Extra"));

        let chapters = vec![ch("a", None, t), ch("b", Some(" "), t)];
        assert_eq!(infer_number(&chapters, 0), None);
    }

    #[test]
    fn chapter_without_any_number_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let t = datetime!(2024-01-01 00:00:00 UTC);
        let entries = policy(dir.path()).plan(&[ch("only", None, t)]);
        assert!(matches!(
            entries[0],
            PlanEntry::Skip {
                reason: SkipReason::NoNumber,
                ..
            }
        ));
    }

    #[test]
    fn exclusions_match_ids_and_names_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let t = datetime!(2024-01-01 00:00:00 UTC);
        let mut by_group = ch("a", Some("1"), t);
        by_group.attributions.push(Attribution {
            kind: AttributionKind::Group,
            id: "g-1".into(),
            name: "Bad Scans".into(),
        });
        let mut by_user = ch("b", Some("2"), t);
        by_user.attributions.push(Attribution {
            kind: AttributionKind::User,
            id: "U-42".into(),
            name: "someone".into(),
        });
        let clean = ch("c", Some("3"), t);

        let exclusions = vec!["bad scans".to_string(), "u-42".to_string()];
        let entries = SyncPolicy::new(dir.path(), &Cutoff::None, &exclusions, None)
            .plan(&[by_group, by_user, clean]);
        assert_eq!(numbers(&entries), vec![None, None, Some("3".into())]);
    }

    #[test]
    fn external_chapters_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ch("a", Some("1"), datetime!(2024-01-01 00:00:00 UTC));
        c.external_url = Some("https://elsewhere.example/ch/1".into());
        let entries = policy(dir.path()).plan(&[c]);
        assert!(matches!(
            &entries[0],
            PlanEntry::Skip {
                reason: SkipReason::External(_),
                ..
            }
        ));
    }

    #[test]
    fn floor_only_applies_to_numeric_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let t = datetime!(2024-01-01 00:00:00 UTC);
        let chapters = vec![
            ch("a", Some("4"), t),
            ch("b", Some("Extra"), t),
            ch("c", Some("5"), t),
        ];
        let entries = SyncPolicy::new(dir.path(), &Cutoff::None, &[], Some(5.0)).plan(&chapters);
        assert_eq!(
            numbers(&entries),
            vec![None, Some("Extra".into()), Some("5".into())]
        );
    }

    #[test]
    fn up_to_date_archive_is_skipped_and_stale_one_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let updated = datetime!(2024-05-01 12:00:00 UTC);
        let chapter = ch("ch-1", Some("1"), updated);
        let policy = policy(dir.path());

        let first = policy.plan(std::slice::from_ref(&chapter));
        let PlanEntry::Download(planned) = &first[0] else {
            panic!("expected download");
        };
        fs::write(&planned.path, b"zip").unwrap();

        set_modified(&planned.path, updated).unwrap();
        assert!(matches!(
            &policy.plan(std::slice::from_ref(&chapter))[0],
            PlanEntry::Skip {
                reason: SkipReason::UpToDate(_),
                ..
            }
        ));

        set_modified(&planned.path, datetime!(2024-04-01 00:00:00 UTC)).unwrap();
        assert!(policy.plan(std::slice::from_ref(&chapter))[0].is_download());
    }

    #[test]
    fn most_recent_local_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            SyncPolicy::new(dir.path(), &Cutoff::MostRecentLocal, &[], None).cutoff(),
            None
        );

        let archive = dir.path().join("001 - x a 2024-01-01 00-00-00.cbz");
        fs::write(&archive, b"zip").unwrap();
        set_modified(&archive, datetime!(2024-02-02 00:00:00 UTC)).unwrap();
        assert_eq!(
            SyncPolicy::new(dir.path(), &Cutoff::MostRecentLocal, &[], None).cutoff(),
            Some(datetime!(2024-02-02 00:00:00 UTC))
        );
    }

    #[test]
    fn labels_and_cutoff_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let entries = policy(dir.path()).plan(&[ch(
            "a",
            Some("7.5"),
            datetime!(2024-01-01 00:00:00 UTC),
        )]);
        let PlanEntry::Download(p) = &entries[0] else {
            panic!("expected download");
        };
        assert_eq!(p.label, "7.5 by Team");
        assert!(
            p.path
                .to_string_lossy()
                .ends_with("007.5 - Team a 2024-01-01 00-00-00.cbz")
        );

        assert_eq!(Cutoff::parse(None).unwrap(), Cutoff::None);
        assert_eq!(Cutoff::parse(Some("AUTO")).unwrap(), Cutoff::MostRecentLocal);
        assert_eq!(
            Cutoff::parse(Some("2024-02-03")).unwrap(),
            Cutoff::At(datetime!(2024-02-03 00:00:00 UTC))
        );
        assert_eq!(
            Cutoff::parse(Some("2024-02-03T10:00:00+02:00")).unwrap(),
            Cutoff::At(datetime!(2024-02-03 08:00:00 UTC))
        );
        assert!(Cutoff::parse(Some("last week")).is_err());
    }

    #[test]
    fn number_formatting() {
        assert_eq!(format_number(2.0 - 0.2), "1.8");
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(0.1 + 0.2), "0.3");
    }
}
