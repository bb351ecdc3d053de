use crate::contracts::HardcodedContract;

const COMMONS: &str = "org/apache/commons/lang3/StringUtils";
const GUAVA: &str = "com/google/common/base/Strings";

const ENTRIES: &[HardcodedContract] = &[
    HardcodedContract::method(COMMONS, "isEmpty", "(Ljava/lang/CharSequence;)Z")
        .contract("null -> true")
        .pure(),
    HardcodedContract::method(COMMONS, "isNotEmpty", "(Ljava/lang/CharSequence;)Z")
        .contract("null -> false")
        .pure(),
    HardcodedContract::method(COMMONS, "isBlank", "(Ljava/lang/CharSequence;)Z")
        .contract("null -> true")
        .pure(),
    HardcodedContract::method(COMMONS, "isNotBlank", "(Ljava/lang/CharSequence;)Z")
        .contract("null -> false")
        .pure(),
    HardcodedContract::method(COMMONS, "defaultString", "(Ljava/lang/String;)Ljava/lang/String;")
        .contract("_ -> !null")
        .pure(),
    HardcodedContract::method(GUAVA, "isNullOrEmpty", "(Ljava/lang/String;)Z")
        .contract("null -> true")
        .pure(),
    HardcodedContract::method(GUAVA, "nullToEmpty", "(Ljava/lang/String;)Ljava/lang/String;")
        .contract("_ -> !null")
        .pure(),
    HardcodedContract::method(GUAVA, "emptyToNull", "(Ljava/lang/String;)Ljava/lang/String;")
        .contract("null -> null")
        .pure(),
];

crate::register_contracts!("strings", ENTRIES);
