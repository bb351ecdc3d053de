use crate::contracts::HardcodedContract;

const COLLECTIONS: &str = "java/util/Collections";

const ENTRIES: &[HardcodedContract] = &[
    HardcodedContract::method(COLLECTIONS, "unmodifiableList", "*").unmodifiable(),
    HardcodedContract::method(COLLECTIONS, "unmodifiableSet", "*").unmodifiable(),
    HardcodedContract::method(COLLECTIONS, "unmodifiableSortedSet", "*").unmodifiable(),
    HardcodedContract::method(COLLECTIONS, "unmodifiableMap", "*").unmodifiable(),
    HardcodedContract::method(COLLECTIONS, "unmodifiableSortedMap", "*").unmodifiable(),
    HardcodedContract::method(COLLECTIONS, "unmodifiableCollection", "*").unmodifiable(),
    HardcodedContract::method(COLLECTIONS, "emptyList", "*").unmodifiable().pure(),
    HardcodedContract::method(COLLECTIONS, "emptySet", "*").unmodifiable().pure(),
    HardcodedContract::method(COLLECTIONS, "emptyMap", "*").unmodifiable().pure(),
    HardcodedContract::method(COLLECTIONS, "singletonList", "*").unmodifiable().pure(),
    HardcodedContract::method(COLLECTIONS, "singleton", "*").unmodifiable().pure(),
    HardcodedContract::method(COLLECTIONS, "singletonMap", "*").unmodifiable().pure(),
    HardcodedContract::method("java/util/List", "of", "*").unmodifiable().pure(),
    HardcodedContract::method("java/util/List", "copyOf", "*").unmodifiable(),
    HardcodedContract::method("java/util/Set", "of", "*").unmodifiable().pure(),
    HardcodedContract::method("java/util/Set", "copyOf", "*").unmodifiable(),
    HardcodedContract::method("java/util/Map", "of", "*").unmodifiable().pure(),
    HardcodedContract::method("java/util/Map", "ofEntries", "*").unmodifiable().pure(),
    HardcodedContract::method("java/util/Map", "copyOf", "*").unmodifiable(),
    HardcodedContract::method("java/util/stream/Stream", "toList", "()Ljava/util/List;")
        .unmodifiable(),
    HardcodedContract::method("java/util/Collection", "size", "()I").pure(),
    HardcodedContract::method("java/util/Collection", "isEmpty", "()Z").pure(),
    HardcodedContract::method("java/util/List", "size", "()I").pure(),
    HardcodedContract::method("java/util/List", "isEmpty", "()Z").pure(),
];

crate::register_contracts!("collections", ENTRIES);
