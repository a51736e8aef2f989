use crate::data::archive::TensorArchive;
use crate::tensor_map::{ExtractionError, TensorExtractor, TensorMap, Validator};
use ndarray::{ArrayD, IxDyn};
use tracing::debug;

/// Wraps an extractor so that failures become NaN-filled tensors.
///
/// One malformed sample then loses only this output instead of the whole row.
/// The wrapped map's validator is disabled so the NaN fill is never rejected.
pub struct NanOnFail {
    map: TensorMap,
    inner: Box<dyn TensorExtractor>,
}

impl NanOnFail {
    /// Wrap a plain tensor map
    pub fn new(map: &TensorMap) -> Self {
        let mut unvalidated = map.clone();
        unvalidated.validator = Validator::None;
        Self {
            map: unvalidated.clone(),
            inner: Box::new(unvalidated),
        }
    }

    /// Wrap an arbitrary extractor
    pub fn wrap(inner: Box<dyn TensorExtractor>) -> Self {
        let mut map = inner.tensor_map().clone();
        map.validator = Validator::None;
        Self { map, inner }
    }

    fn nan_filled(&self) -> ArrayD<f32> {
        ArrayD::from_elem(IxDyn(&self.map.shape), f32::NAN)
    }
}

impl TensorExtractor for NanOnFail {
    fn tensor_map(&self) -> &TensorMap {
        &self.map
    }

    fn tensor_from_file(&self, archive: &TensorArchive) -> Result<ArrayD<f32>, ExtractionError> {
        match self.inner.tensor_from_file(archive) {
            Ok(tensor) => Ok(tensor),
            Err(e) => {
                debug!("Filling {} with NaN: {}", self.map.name, e);
                Ok(self.nan_filled())
            }
        }
    }
}

/// Boxed NaN-on-fail extractors for every map
pub fn nan_on_fail_extractors(maps: &[TensorMap]) -> Vec<Box<dyn TensorExtractor>> {
    maps.iter()
        .map(|tm| Box::new(NanOnFail::new(tm)) as Box<dyn TensorExtractor>)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor_map::Interpretation;
    use std::collections::BTreeMap;

    struct Failing {
        map: TensorMap,
        kind: usize,
    }

    impl TensorExtractor for Failing {
        fn tensor_map(&self) -> &TensorMap {
            &self.map
        }

        fn tensor_from_file(&self, _: &TensorArchive) -> Result<ArrayD<f32>, ExtractionError> {
            Err(match self.kind {
                0 => ExtractionError::Index("bad index".into()),
                1 => ExtractionError::Key("missing".into()),
                2 => ExtractionError::Value("bad value".into()),
                3 => ExtractionError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk")),
                _ => ExtractionError::Runtime("boom".into()),
            })
        }
    }

    #[test]
    fn test_every_failure_kind_becomes_nan() {
        let archive = TensorArchive::from_datasets(BTreeMap::new());
        for kind in 0..5 {
            let map = TensorMap::new("lvef", &[2, 3], Interpretation::Continuous);
            let wrapped = NanOnFail::wrap(Box::new(Failing { map, kind }));
            let tensor = wrapped.tensor_from_file(&archive).unwrap();
            assert_eq!(tensor.shape(), &[2, 3]);
            assert!(tensor.iter().all(|x| x.is_nan()));
        }
    }

    #[test]
    fn test_validator_is_disabled() {
        let map = TensorMap::new("qrs", &[1], Interpretation::Continuous)
            .with_validator(Validator::Range { min: 0.0, max: 1.0 });
        let mut datasets = BTreeMap::new();
        datasets.insert("qrs".to_string(), ArrayD::from_elem(IxDyn(&[1]), 7.0f32));
        let archive = TensorArchive::from_datasets(datasets);

        assert!(map.extract(&archive).is_err());

        let wrapped = NanOnFail::new(&map);
        assert_eq!(wrapped.tensor_map().validator, Validator::None);
        let tensor = wrapped.tensor_from_file(&archive).unwrap();
        assert_eq!(tensor.iter().copied().collect::<Vec<_>>(), vec![7.0]);
    }

    #[test]
    fn test_missing_dataset_is_filled() {
        let map = TensorMap::new("missing", &[4], Interpretation::Categorical);
        let archive = TensorArchive::from_datasets(BTreeMap::new());
        let tensor = NanOnFail::new(&map).tensor_from_file(&archive).unwrap();
        assert_eq!(tensor.len(), 4);
        assert!(tensor.iter().all(|x| x.is_nan()));
    }
}
