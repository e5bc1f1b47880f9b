//! The fixed table catalog and the migration plan built from it.
//!
//! Tables are listed in dependency order: every table named in a descriptor's
//! `depends_on` comes earlier in [`STASH_TABLES`]. Foreign key enforcement is
//! off on the target during the load, so the order is about keeping related
//! rows together rather than satisfying constraints, but it is still checked.

use std::collections::HashMap;

use crate::config::MigrationConfig;
use crate::error::{MigrateError, Result};
use crate::repair::Repair;

/// Default rows per page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Static description of one table to migrate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableDescriptor {
    /// Table name, identical in source and target.
    pub name: &'static str,
    /// Whether the table has a serial `id` whose sequence must be reset.
    pub resync_sequence: bool,
    /// Whether the table may be missing from older source databases.
    pub optional: bool,
    /// Tables this one references.
    pub depends_on: &'static [&'static str],
    /// Repair applied to each page before it is written.
    pub repair: Repair,
}

impl TableDescriptor {
    /// A plain table: no sequence, no dependencies, no repair.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            resync_sequence: false,
            optional: false,
            depends_on: &[],
            repair: Repair::None,
        }
    }

    pub const fn with_sequence(mut self) -> Self {
        self.resync_sequence = true;
        self
    }

    pub const fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub const fn depends_on(mut self, tables: &'static [&'static str]) -> Self {
        self.depends_on = tables;
        self
    }

    pub const fn with_repair(mut self, repair: Repair) -> Self {
        self.repair = repair;
        self
    }
}

const fn table(name: &'static str) -> TableDescriptor {
    TableDescriptor::new(name)
}

/// Every table of a stash database, in load order.
///
/// `folders` and `files` reference each other (zip files contain folders);
/// folders go first since their `zip_file_id` is rarely set.
pub const STASH_TABLES: &[TableDescriptor] = &[
    table("blobs"),
    table("folders").with_sequence(),
    table("files").with_sequence().depends_on(&["folders"]),
    table("files_fingerprints").depends_on(&["files"]),
    table("video_files")
        .depends_on(&["files"])
        .with_repair(Repair::ClampI32 {
            column: "interactive_speed",
        }),
    table("video_captions").depends_on(&["files"]),
    table("image_files").depends_on(&["files"]),
    table("tags").with_sequence().depends_on(&["blobs"]),
    table("tag_aliases").depends_on(&["tags"]),
    table("tags_relations").depends_on(&["tags"]),
    table("studios").with_sequence().depends_on(&["blobs"]),
    table("studio_aliases").depends_on(&["studios"]),
    table("studio_stash_ids").depends_on(&["studios"]),
    table("studios_tags").depends_on(&["studios", "tags"]),
    table("performers").with_sequence().depends_on(&["blobs"]),
    table("performer_aliases").depends_on(&["performers"]),
    table("performer_stash_ids").depends_on(&["performers"]),
    table("performer_urls").depends_on(&["performers"]),
    table("performers_tags").depends_on(&["performers", "tags"]),
    table("performer_custom_fields")
        .optional()
        .depends_on(&["performers"])
        .with_repair(Repair::TypeTag {
            value_column: "value",
            tag_column: "type",
        }),
    table("galleries")
        .with_sequence()
        .depends_on(&["folders", "studios"]),
    table("gallery_urls").depends_on(&["galleries"]),
    table("galleries_files").depends_on(&["galleries", "files"]),
    table("galleries_tags").depends_on(&["galleries", "tags"]),
    table("galleries_chapters")
        .with_sequence()
        .depends_on(&["galleries"]),
    table("performers_galleries").depends_on(&["performers", "galleries"]),
    table("images").with_sequence().depends_on(&["studios"]),
    table("image_urls").depends_on(&["images"]),
    table("images_files").depends_on(&["images", "files"]),
    table("images_tags").depends_on(&["images", "tags"]),
    table("galleries_images").depends_on(&["galleries", "images"]),
    table("performers_images").depends_on(&["performers", "images"]),
    table("scenes")
        .with_sequence()
        .depends_on(&["studios", "blobs"]),
    table("scene_urls").depends_on(&["scenes"]),
    table("scene_stash_ids").depends_on(&["scenes"]),
    table("scenes_files").depends_on(&["scenes", "files"]),
    table("scenes_tags").depends_on(&["scenes", "tags"]),
    table("scenes_galleries").depends_on(&["scenes", "galleries"]),
    table("scenes_o_dates").depends_on(&["scenes"]),
    table("scenes_view_dates").depends_on(&["scenes"]),
    table("performers_scenes").depends_on(&["performers", "scenes"]),
    table("scene_markers")
        .with_sequence()
        .depends_on(&["scenes", "tags"])
        .with_repair(Repair::NormalizeTimestamps {
            columns: &["created_at", "updated_at"],
        }),
    table("scene_markers_tags").depends_on(&["scene_markers", "tags"]),
    table("groups")
        .with_sequence()
        .depends_on(&["studios", "blobs"]),
    table("group_urls").depends_on(&["groups"]),
    table("groups_relations").depends_on(&["groups"]),
    table("groups_scenes").depends_on(&["groups", "scenes"]),
    table("groups_tags").depends_on(&["groups", "tags"]),
    table("saved_filters")
        .with_sequence()
        .with_repair(Repair::ValidJson {
            columns: &["find_filter", "object_filter", "ui_options"],
        }),
];

/// Look up a catalog table by name.
pub fn find_table(name: &str) -> Option<&'static TableDescriptor> {
    STASH_TABLES.iter().find(|t| t.name == name)
}

/// Immutable description of one migration run: which tables, in which
/// order, and how many rows per page.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationPlan {
    pub tables: Vec<TableDescriptor>,
    pub page_size: usize,
}

impl MigrationPlan {
    /// Build a plan from an explicit table list.
    ///
    /// Fails if the page size is zero, a table appears twice, or a table
    /// is listed before one of its dependencies.
    pub fn new(tables: Vec<TableDescriptor>, page_size: usize) -> Result<Self> {
        if page_size == 0 {
            return Err(MigrateError::Config(
                "page size must be at least 1".into(),
            ));
        }
        let plan = Self { tables, page_size };
        plan.check_order()?;
        Ok(plan)
    }

    /// The full stash catalog.
    pub fn stash(page_size: usize) -> Result<Self> {
        Self::new(STASH_TABLES.to_vec(), page_size)
    }

    /// Build the plan described by the migration config.
    ///
    /// `include_tables` (when non-empty) selects tables, `exclude_tables`
    /// removes them; catalog order is kept either way.
    pub fn from_config(config: &MigrationConfig) -> Result<Self> {
        for name in config.include_tables.iter().chain(&config.exclude_tables) {
            if find_table(name).is_none() {
                return Err(MigrateError::Config(format!(
                    "unknown table '{}' in include/exclude list",
                    name
                )));
            }
        }

        let tables = STASH_TABLES
            .iter()
            .filter(|t| {
                config.include_tables.is_empty()
                    || config.include_tables.iter().any(|n| n == t.name)
            })
            .filter(|t| !config.exclude_tables.iter().any(|n| n == t.name))
            .copied()
            .collect();

        Self::new(tables, config.page_size)
    }

    /// Tables whose sequences are reset after the load.
    pub fn sequence_tables(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.iter().filter(|t| t.resync_sequence)
    }

    /// Dependencies outside the plan are ignored: a filtered plan may load
    /// a child table whose parent is already in the target.
    fn check_order(&self) -> Result<()> {
        let positions: HashMap<&str, usize> = self
            .tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name, i))
            .collect();

        if positions.len() != self.tables.len() {
            return Err(MigrateError::Config(
                "table list contains duplicates".into(),
            ));
        }

        for (pos, table) in self.tables.iter().enumerate() {
            for dep in table.depends_on {
                if let Some(&dep_pos) = positions.get(dep) {
                    if dep_pos > pos {
                        return Err(MigrateError::Config(format!(
                            "table '{}' is ordered before its dependency '{}'",
                            table.name, dep
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPECTED_TABLES: &[&str] = &[
        "blobs", "files", "files_fingerprints", "folders", "galleries",
        "galleries_chapters", "galleries_files", "galleries_images", "galleries_tags",
        "gallery_urls", "group_urls", "groups", "groups_relations", "groups_scenes",
        "groups_tags", "image_files", "image_urls", "images", "images_files",
        "images_tags", "performer_aliases", "performer_stash_ids", "performer_urls",
        "performers", "performers_galleries", "performers_images", "performers_scenes",
        "performers_tags", "saved_filters", "scene_markers", "scene_markers_tags",
        "scene_stash_ids", "scene_urls", "scenes", "scenes_files", "scenes_galleries",
        "scenes_o_dates", "scenes_tags", "scenes_view_dates", "studio_aliases",
        "studio_stash_ids", "studios", "studios_tags", "tag_aliases", "tags",
        "tags_relations", "video_captions", "video_files",
    ];

    #[test]
    fn test_catalog_covers_every_stash_table() {
        for name in EXPECTED_TABLES {
            assert!(find_table(name).is_some(), "missing table {}", name);
        }
        assert_eq!(STASH_TABLES.len(), EXPECTED_TABLES.len() + 1);
        assert!(find_table("performer_custom_fields").unwrap().optional);
    }

    #[test]
    fn test_catalog_is_dependency_ordered() {
        let plan = MigrationPlan::stash(DEFAULT_PAGE_SIZE).unwrap();
        for (pos, table) in plan.tables.iter().enumerate() {
            for dep in table.depends_on {
                let dep_pos = plan
                    .tables
                    .iter()
                    .position(|t| t.name == *dep)
                    .unwrap_or_else(|| panic!("{} depends on unknown {}", table.name, dep));
                assert!(dep_pos < pos, "{} before {}", table.name, dep);
            }
        }
    }

    #[test]
    fn test_sequence_tables() {
        let plan = MigrationPlan::stash(DEFAULT_PAGE_SIZE).unwrap();
        let mut names: Vec<&str> = plan.sequence_tables().map(|t| t.name).collect();
        names.sort_unstable();
        assert_eq!(
            names,
            vec![
                "files", "folders", "galleries", "galleries_chapters", "groups", "images",
                "performers", "saved_filters", "scene_markers", "scenes", "studios", "tags",
            ]
        );
    }

    #[test]
    fn test_repairs_registered() {
        assert!(matches!(
            find_table("video_files").unwrap().repair,
            Repair::ClampI32 { column: "interactive_speed" }
        ));
        assert!(matches!(
            find_table("saved_filters").unwrap().repair,
            Repair::ValidJson { .. }
        ));
        assert!(matches!(
            find_table("scene_markers").unwrap().repair,
            Repair::NormalizeTimestamps { .. }
        ));
        assert_eq!(find_table("tags").unwrap().repair, Repair::None);
    }

    #[test]
    fn test_plan_rejects_bad_order() {
        let tables = vec![
            TableDescriptor::new("child").depends_on(&["parent"]),
            TableDescriptor::new("parent"),
        ];
        assert!(MigrationPlan::new(tables, 10).is_err());
    }

    #[test]
    fn test_plan_rejects_duplicates_and_zero_page() {
        let tables = vec![TableDescriptor::new("a"), TableDescriptor::new("a")];
        assert!(MigrationPlan::new(tables, 10).is_err());
        assert!(MigrationPlan::new(vec![TableDescriptor::new("a")], 0).is_err());
    }

    #[test]
    fn test_plan_from_config_filters() {
        let config = MigrationConfig {
            include_tables: vec!["tags".into(), "scenes".into(), "scenes_tags".into()],
            exclude_tables: vec!["scenes".into()],
            page_size: 250,
            ..Default::default()
        };
        let plan = MigrationPlan::from_config(&config).unwrap();
        let names: Vec<&str> = plan.tables.iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["tags", "scenes_tags"]);
        assert_eq!(plan.page_size, 250);
    }

    #[test]
    fn test_plan_from_config_rejects_unknown_table() {
        let config = MigrationConfig {
            include_tables: vec!["nope".into()],
            ..Default::default()
        };
        assert!(MigrationPlan::from_config(&config).is_err());
    }
}
