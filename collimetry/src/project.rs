//! The project container the host persists: current geometry, an
//! append-only version history, stored results, notes and a thumbnail.
//!
//! Version numbers are monotone integers assigned on save. Restoring a
//! version never rewrites history; it copies the old payload forward as
//! a new version. On disk a project is a bincode document inside an LZ4
//! frame; readers fall back transparently to uncompressed documents
//! written by older hosts.

use super::error::{Error, Result};
use super::geometry::CollimatorGeometry;
use super::result::SimulationResult;
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom, Write};

/// Magic bytes of an LZ4 frame, little endian.
const LZ4_FRAME_MAGIC: [u8; 4] = [0x04, 0x22, 0x4d, 0x18];

/// One snapshot in the version history.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct GeometryVersion {
    /// Monotone version number, starting at 1.
    pub number: u32,
    /// The geometry as it was when the version was saved.
    pub geometry: CollimatorGeometry,
    /// Optional change note.
    pub note: Option<String>,
}

/// A design project: the working geometry plus everything the host
/// wants to keep next to it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Project {
    /// The current working geometry.
    pub geometry: CollimatorGeometry,
    versions: Vec<GeometryVersion>,
    /// Stored simulation results, newest last.
    pub results: Vec<SimulationResult>,
    /// Free-form notes.
    pub notes: String,
    /// Encoded thumbnail image, opaque to the engine.
    pub thumbnail: Option<Vec<u8>>,
}

impl Project {
    /// A fresh project around a geometry, with an empty history.
    #[must_use]
    pub const fn new(geometry: CollimatorGeometry) -> Self {
        Self {
            geometry,
            versions: Vec::new(),
            results: Vec::new(),
            notes: String::new(),
            thumbnail: None,
        }
    }

    /// The version history, oldest first.
    #[must_use]
    pub fn versions(&self) -> &[GeometryVersion] {
        &self.versions
    }

    /// Snapshots the working geometry as the next version and returns
    /// its number.
    pub fn save_version(&mut self, note: Option<String>) -> u32 {
        let number = self.versions.last().map_or(0, |v| v.number) + 1;
        self.versions.push(GeometryVersion {
            number,
            geometry: self.geometry.clone(),
            note,
        });
        number
    }

    /// Restores version `number` into the working geometry. The restore
    /// itself is saved as a new version, so history only ever grows.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown version number.
    pub fn restore_version(&mut self, number: u32) -> Result<u32> {
        let snapshot = self
            .versions
            .iter()
            .find(|v| v.number == number)
            .ok_or_else(|| Error::Other(anyhow!("project has no version {number}")))?
            .geometry
            .clone();

        self.geometry = snapshot;
        Ok(self.save_version(Some(format!("restored from version {number}"))))
    }

    /// Appends a simulation result to the project.
    pub fn add_result(&mut self, result: SimulationResult) {
        self.results.push(result);
    }

    /// Serializes the project into `writer` as an LZ4-framed bincode
    /// document. Writing is not buffered.
    ///
    /// # Errors
    ///
    /// Serialization and I/O failures.
    pub fn write(&self, writer: impl Write) -> Result<()> {
        let mut encoder = lz4_flex::frame::FrameEncoder::new(writer);
        bincode::serialize_into(&mut encoder, self).map_err(|e| Error::Other(e.into()))?;
        encoder
            .finish()
            .map(|_| ())
            .map_err(|e| Error::Other(e.into()))
    }

    /// Deserializes a project from `reader`, accepting both compressed
    /// and plain documents. Reading is not buffered.
    ///
    /// # Errors
    ///
    /// Deserialization and I/O failures.
    pub fn read(mut reader: impl Read + Seek) -> Result<Self> {
        let mut magic = [0_u8; 4];
        let got = reader.read(&mut magic).map_err(|e| Error::Other(e.into()))?;
        reader
            .seek(SeekFrom::Start(0))
            .map_err(|e| Error::Other(e.into()))?;

        if got == magic.len() && magic == LZ4_FRAME_MAGIC {
            let decoder = lz4_flex::frame::FrameDecoder::new(reader);
            bincode::deserialize_from(decoder).map_err(|e| Error::Other(e.into()))
        } else {
            bincode::deserialize_from(reader).map_err(|e| Error::Other(e.into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Aperture, CollimatorType, Detector, Layer, Source, Stage};
    use std::io::Cursor;

    fn geometry(depth_mm: f64) -> CollimatorGeometry {
        CollimatorGeometry {
            collimator_type: CollimatorType::Slit,
            source: Source::default(),
            stages: vec![Stage {
                z_mm: 100.0,
                depth_mm,
                outer_width_mm: 200.0,
                aperture: Aperture::Open,
                layers: vec![Layer {
                    material_id: "pb".to_string(),
                    thickness_mm: depth_mm,
                    purpose: String::new(),
                }],
            }],
            detector: Detector {
                z_mm: 500.0,
                width_mm: 400.0,
            },
        }
    }

    #[test]
    fn version_numbers_are_monotone() {
        let mut project = Project::new(geometry(10.0));
        assert_eq!(project.save_version(None), 1);
        project.geometry = geometry(20.0);
        assert_eq!(project.save_version(Some("deeper".to_string())), 2);
        assert_eq!(
            project.versions().iter().map(|v| v.number).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn restore_appends_instead_of_rewriting() {
        let mut project = Project::new(geometry(10.0));
        project.save_version(None);
        project.geometry = geometry(20.0);
        project.save_version(None);

        let restored = project.restore_version(1).unwrap();
        assert_eq!(restored, 3);
        assert_eq!(project.versions().len(), 3);
        assert_eq!(project.geometry, geometry(10.0));
        // the restored payload equals version 1's payload
        assert_eq!(project.versions()[2].geometry, project.versions()[0].geometry);
        // history before the restore is untouched
        assert_eq!(project.versions()[1].geometry, geometry(20.0));
    }

    #[test]
    fn unknown_versions_are_rejected() {
        let mut project = Project::new(geometry(10.0));
        assert!(project.restore_version(7).is_err());
    }

    #[test]
    fn projects_round_trip_compressed() {
        let mut project = Project::new(geometry(10.0));
        project.notes = "two-stage draft".to_string();
        project.thumbnail = Some(vec![1, 2, 3, 4]);
        project.save_version(Some("initial".to_string()));

        let mut buffer = Vec::new();
        project.write(&mut buffer).unwrap();
        assert_eq!(&buffer[..4], &super::LZ4_FRAME_MAGIC);

        let back = Project::read(Cursor::new(buffer)).unwrap();
        assert_eq!(back, project);
    }

    #[test]
    fn source_configs_survive_the_binary_container() {
        use crate::geometry::SourceConfig;

        let mut project = Project::new(geometry(10.0));
        let config: serde_yaml::Value =
            serde_yaml::from_str("mode: linac\nnominal_mv: 6.0").unwrap();
        project.geometry.source.config = Some(SourceConfig(config));
        project.save_version(None);

        let mut buffer = Vec::new();
        project.write(&mut buffer).unwrap();
        let back = Project::read(Cursor::new(buffer)).unwrap();
        assert_eq!(back.geometry.source.config, project.geometry.source.config);
    }

    #[test]
    fn plain_bincode_documents_still_load() {
        let mut project = Project::new(geometry(10.0));
        project.save_version(None);

        let buffer = bincode::serialize(&project).unwrap();
        let back = Project::read(Cursor::new(buffer)).unwrap();
        assert_eq!(back, project);
    }
}
