//! Direct import of externally computed feature matches.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::cache::MatcherCache;
use crate::database::Database;
use crate::options::{FeaturePairsConfig, MatchingConfig};
use crate::types::{FeatureMatch, FeatureMatches, StopToken};

/// Metadata working-set size; the importer reads no descriptors.
const CACHE_SIZE: usize = 100;

/// Imports match records from a text file instead of running matchers.
///
/// The file is record-oriented: the first line of a record is
/// `name1 name2`, followed by zero or more `idx1 idx2` feature index
/// lines, terminated by a blank line. Records whose pair already has
/// matches in the database are skipped; a malformed feature line ends
/// that record's parse and the lines read so far are imported.
pub struct FeaturePairsImporter {
    options: FeaturePairsConfig,
    database: Arc<dyn Database>,
    stop: StopToken,
}

impl FeaturePairsImporter {
    pub fn new(
        options: FeaturePairsConfig,
        match_options: MatchingConfig,
        database: Arc<dyn Database>,
    ) -> Result<Self> {
        options.check()?;
        match_options.check()?;
        Ok(Self {
            options,
            database,
            stop: StopToken::new(),
        })
    }

    /// Token that cancels the import at the next record boundary.
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    pub fn run(&self) -> Result<()> {
        info!("Importing matches");

        let mut cache = MatcherCache::new(CACHE_SIZE, Arc::clone(&self.database));
        cache.setup()?;

        let mut name_to_id = HashMap::with_capacity(cache.num_images());
        for image_id in cache.image_ids() {
            if let Some(image) = cache.image(image_id) {
                name_to_id.insert(image.name.clone(), image_id);
            }
        }

        let path = &self.options.match_list_path;
        let file =
            File::open(path).with_context(|| format!("opening match file {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        while let Some(line) = lines.next() {
            if self.stop.is_stopped() {
                info!("import stopped");
                return Ok(());
            }

            let line = line?;
            let header = line.trim();
            if header.is_empty() {
                continue;
            }

            let mut tokens = header.split_whitespace();
            let (Some(name1), Some(name2)) = (tokens.next(), tokens.next()) else {
                error!("could not read image pair from line {header:?}");
                break;
            };
            info!("{name1} - {name2}");

            let image_id1 = name_to_id.get(name1).copied();
            let image_id2 = name_to_id.get(name2).copied();
            if image_id1.is_none() {
                warn!("image {name1} not found in database, skipping record");
            }
            if image_id2.is_none() {
                warn!("image {name2} not found in database, skipping record");
            }

            let mut skip_record = image_id1.is_none() || image_id2.is_none();
            if let (Some(image_id1), Some(image_id2)) = (image_id1, image_id2) {
                if self.database.exists_matches(image_id1, image_id2)? {
                    info!("matches for this pair already exist, skipping record");
                    skip_record = true;
                }
            }

            // The record's feature lines are consumed either way so the
            // parse stays aligned with the record boundaries.
            let mut matches = FeatureMatches::new();
            for line in lines.by_ref() {
                let line = line?;
                let line = line.trim();
                if line.is_empty() {
                    break;
                }
                match parse_feature_match(line) {
                    Some(feature_match) => matches.push(feature_match),
                    None => {
                        error!("cannot read feature match from line {line:?}");
                        break;
                    }
                }
            }

            if skip_record {
                continue;
            }

            if let (Some(image_id1), Some(image_id2)) = (image_id1, image_id2) {
                self.database.write_matches(image_id1, image_id2, &matches)?;
            }
        }

        Ok(())
    }
}

fn parse_feature_match(line: &str) -> Option<FeatureMatch> {
    let mut tokens = line.split_whitespace();
    let idx1 = tokens.next()?.parse().ok()?;
    let idx2 = tokens.next()?.parse().ok()?;
    Some(FeatureMatch::new(idx1, idx2))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use nalgebra::Vector3;

    use crate::database::InMemoryDatabase;
    use crate::types::{CameraId, Image, ImageId};

    use super::*;

    fn seeded_database(names: &[&str]) -> Arc<InMemoryDatabase> {
        let database = InMemoryDatabase::new();
        for (i, name) in names.iter().enumerate() {
            database.add_image(Image {
                image_id: ImageId::new(i as u32 + 1),
                name: name.to_string(),
                camera_id: CameraId::new(1),
                tvec_prior: Vector3::zeros(),
                qvec_prior: None,
            });
        }
        Arc::new(database)
    }

    fn import(database: &Arc<InMemoryDatabase>, content: &str) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();

        let importer = FeaturePairsImporter::new(
            FeaturePairsConfig::new(file.path()),
            MatchingConfig::default(),
            Arc::clone(database) as Arc<dyn Database>,
        )
        .unwrap();
        importer.run().unwrap();
    }

    #[test]
    fn test_imports_records() {
        let database = seeded_database(&["a.jpg", "b.jpg", "c.jpg"]);
        import(
            &database,
            "a.jpg b.jpg\n0 1\n2 3\n\nb.jpg c.jpg\n5 6\n\n",
        );

        assert_eq!(
            database.read_matches(ImageId::new(1), ImageId::new(2)).unwrap(),
            vec![FeatureMatch::new(0, 1), FeatureMatch::new(2, 3)]
        );
        assert_eq!(
            database.read_matches(ImageId::new(2), ImageId::new(3)).unwrap(),
            vec![FeatureMatch::new(5, 6)]
        );
    }

    #[test]
    fn test_existing_pair_skipped_without_losing_alignment() {
        let database = seeded_database(&["a.jpg", "b.jpg", "c.jpg"]);
        database
            .write_matches(ImageId::new(1), ImageId::new(2), &[FeatureMatch::new(9, 9)])
            .unwrap();

        import(
            &database,
            "a.jpg b.jpg\n0 1\n\nb.jpg c.jpg\n5 6\n\n",
        );

        // The pre-existing record is untouched and the following record
        // was still parsed correctly.
        assert_eq!(
            database.read_matches(ImageId::new(1), ImageId::new(2)).unwrap(),
            vec![FeatureMatch::new(9, 9)]
        );
        assert_eq!(
            database.read_matches(ImageId::new(2), ImageId::new(3)).unwrap(),
            vec![FeatureMatch::new(5, 6)]
        );
    }

    #[test]
    fn test_unknown_image_skips_record_only() {
        let database = seeded_database(&["a.jpg", "b.jpg"]);
        import(
            &database,
            "a.jpg missing.jpg\n0 1\n\na.jpg b.jpg\n4 5\n\n",
        );

        assert_eq!(database.num_match_records(), 1);
        assert_eq!(
            database.read_matches(ImageId::new(1), ImageId::new(2)).unwrap(),
            vec![FeatureMatch::new(4, 5)]
        );
    }

    #[test]
    fn test_malformed_feature_line_keeps_prefix() {
        let database = seeded_database(&["a.jpg", "b.jpg"]);
        import(&database, "a.jpg b.jpg\n0 1\nnot numbers\n7 8\n\n");

        // The record is imported up to the malformed line.
        assert_eq!(
            database.read_matches(ImageId::new(1), ImageId::new(2)).unwrap(),
            vec![FeatureMatch::new(0, 1)]
        );
    }

    #[test]
    fn test_empty_record_writes_empty_matches() {
        let database = seeded_database(&["a.jpg", "b.jpg"]);
        import(&database, "a.jpg b.jpg\n\n");

        assert!(database.exists_matches(ImageId::new(1), ImageId::new(2)).unwrap());
        assert!(database
            .read_matches(ImageId::new(1), ImageId::new(2))
            .unwrap()
            .is_empty());
    }
}
