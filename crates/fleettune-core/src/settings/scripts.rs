//! Long script bodies used by the setting writers.

/// Bash script that off-lines cores until `cores` remain per socket.
/// The highest numbered cores go first; all logical CPUs are brought
/// back online before counting so the result is deterministic.
pub(super) fn set_core_count_script(cores: u32) -> String {
    format!(
        r#"desired_core_count_per_socket={cores}
num_cpus=$(ls /sys/devices/system/cpu/ | grep -E "^cpu[0-9]+$" | wc -l)
num_threads=$(lscpu | grep 'Thread(s) per core' | awk '{{print $NF}}')
num_sockets=$(lscpu | grep 'Socket(s)' | awk '{{print $NF}}')
num_cores_per_socket=$((num_cpus / num_sockets / num_threads))

# if desired core count is greater than current core count, exit
if [[ $desired_core_count_per_socket -gt $num_cores_per_socket ]]; then
    echo "requested core count ($desired_core_count_per_socket) is greater than physical cores ($num_cores_per_socket)"
    exit 1
fi

# enable all logical CPUs
echo 1 | tee /sys/devices/system/cpu/cpu*/online > /dev/null

# if no cores to disable, exit
num_cores_to_disable_per_socket=$((num_cores_per_socket - desired_core_count_per_socket))
if [[ $num_cores_to_disable_per_socket -eq 0 ]]; then
    echo "no cpus to off-line"
    exit 0
fi

# get lines from cpuinfo that match the fields we need
proc_cpuinfo_filtered=$(grep -E '(processor|core id|physical id)' /proc/cpuinfo)

# build one record per logical CPU
while IFS= read -r line; do
    if [[ $line =~ "processor" ]]; then
        if [[ -n "$record" ]]; then
            cpuinfo+=("$record")
        fi
        record="$line"$'\n'
    else
        record+="$line"$'\n'
    fi
done <<< "$proc_cpuinfo_filtered"
if [[ -n "$record" ]]; then
    cpuinfo+=("$record")
fi

# build a unique list of core ids from the records
core_ids=()
for record in "${{cpuinfo[@]}}"; do
    core_id=$(echo "$record" | grep 'core id' | awk '{{print $NF}}')
    found=0
    for id in "${{core_ids[@]}}"; do
        if [[ "$id" == "$core_id" ]]; then
            found=1
            break
        fi
    done
    if [[ $found -eq 0 ]]; then
        core_ids+=("$core_id")
    fi
done

# disable logical CPUs to reach the desired core count per socket
for ((socket=0; socket<num_sockets; socket++)); do
    offlined_cores=0
    # walk core_ids in reverse to off-line the highest numbered cores first
    for ((i=${{#core_ids[@]}}-1; i>=0; i--)); do
        core=${{core_ids[i]}}
        if [[ $offlined_cores -eq $num_cores_to_disable_per_socket ]]; then
            break
        fi
        offlined_cores=$((offlined_cores+1))
        # find the record that matches socket and core, then off-line the logical CPU
        for record in "${{cpuinfo[@]}}"; do
            processor=$(echo "$record" | grep 'processor' | awk '{{print $NF}}')
            core_id=$(echo "$record" | grep 'core id' | awk '{{print $NF}}')
            physical_id=$(echo "$record" | grep 'physical id' | awk '{{print $NF}}')
            if [[ $physical_id -eq $socket && $core_id -eq $core ]]; then
                echo "Off-lining processor $processor (socket $physical_id, core $core_id)"
                echo 0 | tee /sys/devices/system/cpu/cpu"$processor"/online > /dev/null
            fi
        done
    done
done
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_count_is_substituted() {
        let script = set_core_count_script(86);
        assert!(script.starts_with("desired_core_count_per_socket=86"));
        assert!(script.contains("cpu*/online"));
    }
}
