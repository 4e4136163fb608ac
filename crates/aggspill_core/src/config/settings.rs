//! Named settings for configuring an aggregation run.
//!
//! Settings are get and set using scalar values so they can be driven from
//! an outer `SET name = value` style interface.

use std::collections::HashMap;
use std::sync::LazyLock;

use aggspill_error::{DbError, ErrorKind, Result};

use super::aggregate::{AggregateConfig, MAX_NUM_BUCKETS, OverflowMode};
use crate::arrays::scalar::ScalarValue;

impl AggregateConfig {
    pub fn set_from_scalar(&mut self, name: &str, value: &ScalarValue) -> Result<()> {
        let func = lookup(name)?;
        (func.set)(value, self).map_err(|e| {
            e.reclassify(ErrorKind::InvalidInput)
                .with_field("setting", name.to_string())
        })
    }

    pub fn get_as_scalar(&self, name: &str) -> Result<ScalarValue> {
        let func = lookup(name)?;
        Ok((func.get)(self))
    }

    /// Reset a setting to its default value.
    pub fn reset(&mut self, name: &str) -> Result<()> {
        let func = lookup(name)?;
        let def_conf = AggregateConfig::new(Vec::new(), Vec::new());
        let scalar = (func.get)(&def_conf);
        (func.set)(&scalar, self)
    }
}

/// Names of all known settings.
pub fn setting_names() -> impl Iterator<Item = &'static str> {
    GET_SET_FUNCTIONS.keys().copied()
}

fn lookup(name: &str) -> Result<&'static SettingFunctions> {
    GET_SET_FUNCTIONS
        .get(name)
        .ok_or_else(|| DbError::invalid_input(format!("Missing setting for '{name}'")))
}

struct SettingFunctions {
    set: fn(scalar: &ScalarValue, conf: &mut AggregateConfig) -> Result<()>,
    get: fn(conf: &AggregateConfig) -> ScalarValue,
}

impl SettingFunctions {
    const fn new<S: AggregateSetting>() -> Self {
        SettingFunctions {
            set: S::set_from_scalar as _,
            get: S::get_as_scalar as _,
        }
    }
}

fn insert_setting<S: AggregateSetting>(map: &mut HashMap<&'static str, SettingFunctions>) {
    if map.insert(S::NAME, SettingFunctions::new::<S>()).is_some() {
        panic!("Duplicate settings names: {}", S::NAME);
    }
}

static GET_SET_FUNCTIONS: LazyLock<HashMap<&'static str, SettingFunctions>> = LazyLock::new(|| {
    let mut map = HashMap::new();

    insert_setting::<MemoryThresholdBytes>(&mut map);
    insert_setting::<NumBuckets>(&mut map);
    insert_setting::<SpillEnabled>(&mut map);
    insert_setting::<FinalizeOutput>(&mut map);
    insert_setting::<BatchSize>(&mut map);
    insert_setting::<TwoLevelThresholdRows>(&mut map);
    insert_setting::<TwoLevelThresholdBytes>(&mut map);
    insert_setting::<MaxGroups>(&mut map);
    insert_setting::<GroupByOverflowMode>(&mut map);

    map
});

pub trait AggregateSetting: Sync + Send + 'static {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut AggregateConfig) -> Result<()>;
    fn get_as_scalar(conf: &AggregateConfig) -> ScalarValue;
}

fn usize_to_scalar(v: usize) -> ScalarValue {
    ScalarValue::Int64(i64::try_from(v).unwrap_or(i64::MAX))
}

pub struct MemoryThresholdBytes;

impl AggregateSetting for MemoryThresholdBytes {
    const NAME: &'static str = "memory_threshold_bytes";
    const DESCRIPTION: &'static str =
        "Estimated bytes the grouping table may hold before spilling to disk";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut AggregateConfig) -> Result<()> {
        conf.memory_threshold_bytes = scalar.try_as_usize()?;
        Ok(())
    }

    fn get_as_scalar(conf: &AggregateConfig) -> ScalarValue {
        usize_to_scalar(conf.memory_threshold_bytes)
    }
}

pub struct NumBuckets;

impl AggregateSetting for NumBuckets {
    const NAME: &'static str = "num_buckets";
    const DESCRIPTION: &'static str = "Number of buckets groups are partitioned into for spilling";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut AggregateConfig) -> Result<()> {
        let val = scalar.try_as_usize()?;
        if val == 0 {
            return Err(DbError::invalid_input(
                "Number of buckets must be greater than zero",
            ));
        }
        if val > MAX_NUM_BUCKETS {
            return Err(DbError::invalid_input(format!(
                "Number of buckets cannot be greater than {MAX_NUM_BUCKETS}"
            )));
        }
        conf.num_buckets = val;
        Ok(())
    }

    fn get_as_scalar(conf: &AggregateConfig) -> ScalarValue {
        usize_to_scalar(conf.num_buckets)
    }
}

pub struct SpillEnabled;

impl AggregateSetting for SpillEnabled {
    const NAME: &'static str = "spill_enabled";
    const DESCRIPTION: &'static str = "If aggregate state may be written to temporary files";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut AggregateConfig) -> Result<()> {
        conf.spill_enabled = scalar.try_as_bool()?;
        Ok(())
    }

    fn get_as_scalar(conf: &AggregateConfig) -> ScalarValue {
        conf.spill_enabled.into()
    }
}

pub struct FinalizeOutput;

impl AggregateSetting for FinalizeOutput {
    const NAME: &'static str = "finalize_output";
    const DESCRIPTION: &'static str =
        "Produce final aggregate values instead of serialized partial states";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut AggregateConfig) -> Result<()> {
        conf.finalize_output = scalar.try_as_bool()?;
        Ok(())
    }

    fn get_as_scalar(conf: &AggregateConfig) -> ScalarValue {
        conf.finalize_output.into()
    }
}

pub struct BatchSize;

impl AggregateSetting for BatchSize {
    const NAME: &'static str = "batch_size";
    const DESCRIPTION: &'static str = "Max number of rows in an output batch";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut AggregateConfig) -> Result<()> {
        let val = scalar.try_as_usize()?;
        if val == 0 {
            return Err(DbError::invalid_input("Batch size cannot be less than 1"));
        }
        conf.batch_size = val;
        Ok(())
    }

    fn get_as_scalar(conf: &AggregateConfig) -> ScalarValue {
        usize_to_scalar(conf.batch_size)
    }
}

pub struct TwoLevelThresholdRows;

impl AggregateSetting for TwoLevelThresholdRows {
    const NAME: &'static str = "two_level_threshold_rows";
    const DESCRIPTION: &'static str =
        "Number of groups at which the grouping table is split per bucket, 0 to disable";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut AggregateConfig) -> Result<()> {
        conf.two_level_threshold_rows = scalar.try_as_usize()?;
        Ok(())
    }

    fn get_as_scalar(conf: &AggregateConfig) -> ScalarValue {
        usize_to_scalar(conf.two_level_threshold_rows)
    }
}

pub struct TwoLevelThresholdBytes;

impl AggregateSetting for TwoLevelThresholdBytes {
    const NAME: &'static str = "two_level_threshold_bytes";
    const DESCRIPTION: &'static str =
        "Estimated bytes at which the grouping table is split per bucket, 0 to disable";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut AggregateConfig) -> Result<()> {
        conf.two_level_threshold_bytes = scalar.try_as_usize()?;
        Ok(())
    }

    fn get_as_scalar(conf: &AggregateConfig) -> ScalarValue {
        usize_to_scalar(conf.two_level_threshold_bytes)
    }
}

pub struct MaxGroups;

impl AggregateSetting for MaxGroups {
    const NAME: &'static str = "max_groups";
    const DESCRIPTION: &'static str = "Max number of distinct groups, NULL for no limit";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut AggregateConfig) -> Result<()> {
        conf.max_groups = match scalar {
            ScalarValue::Null => None,
            other => Some(other.try_as_usize()?),
        };
        Ok(())
    }

    fn get_as_scalar(conf: &AggregateConfig) -> ScalarValue {
        conf.max_groups.map(usize_to_scalar).unwrap_or(ScalarValue::Null)
    }
}

pub struct GroupByOverflowMode;

impl AggregateSetting for GroupByOverflowMode {
    const NAME: &'static str = "group_by_overflow_mode";
    const DESCRIPTION: &'static str =
        "Behavior when max_groups is reached, one of 'throw', 'break', or 'any'";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut AggregateConfig) -> Result<()> {
        conf.overflow_mode = OverflowMode::from_name(scalar.try_as_str()?)?;
        Ok(())
    }

    fn get_as_scalar(conf: &AggregateConfig) -> ScalarValue {
        conf.overflow_mode.as_str().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_test_config() -> AggregateConfig {
        AggregateConfig::new([0], Vec::new())
    }

    #[test]
    fn set_setting_exists() {
        let mut conf = new_test_config();
        conf.set_from_scalar("num_buckets", &ScalarValue::Int64(16))
            .unwrap();

        assert_eq!(16, conf.num_buckets);
        assert_eq!(
            ScalarValue::Int64(16),
            conf.get_as_scalar("num_buckets").unwrap()
        );
    }

    #[test]
    fn set_setting_not_exists() {
        let mut conf = new_test_config();
        let err = conf
            .set_from_scalar("hello_world", &ScalarValue::Int64(58))
            .unwrap_err();
        assert_eq!(ErrorKind::InvalidInput, err.kind());
    }

    #[test]
    fn set_wrong_type() {
        let mut conf = new_test_config();
        let cases = [
            ("spill_enabled", ScalarValue::Int64(1)),
            ("num_buckets", ScalarValue::Int64(-4)),
            ("num_buckets", ScalarValue::Int64(0)),
            ("num_buckets", ScalarValue::Int64(1 << 31)),
            ("group_by_overflow_mode", ScalarValue::Int64(0)),
        ];
        for (name, value) in cases {
            let err = conf.set_from_scalar(name, &value).unwrap_err();
            assert_eq!(ErrorKind::InvalidInput, err.kind(), "setting: {name}");
            assert_eq!(Some(name), err.get_field("setting"));
        }
    }

    #[test]
    fn max_groups_nullable() {
        let mut conf = new_test_config();
        conf.set_from_scalar("max_groups", &ScalarValue::Int64(10))
            .unwrap();
        assert_eq!(Some(10), conf.max_groups);

        conf.set_from_scalar("max_groups", &ScalarValue::Null)
            .unwrap();
        assert_eq!(None, conf.max_groups);
    }

    #[test]
    fn overflow_mode_setting() {
        let mut conf = new_test_config();
        conf.set_from_scalar("group_by_overflow_mode", &"any".into())
            .unwrap();
        assert_eq!(OverflowMode::Any, conf.overflow_mode);

        conf.reset("group_by_overflow_mode").unwrap();
        assert_eq!(OverflowMode::Throw, conf.overflow_mode);
    }

    #[test]
    fn every_setting_round_trips_default() {
        let mut conf = new_test_config();
        for name in setting_names() {
            let val = conf.get_as_scalar(name).unwrap();
            conf.set_from_scalar(name, &val).unwrap();
            conf.reset(name).unwrap();
        }
    }
}
